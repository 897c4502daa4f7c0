//! Network fetch capability.
//!
//! The downloader only needs "GET this URL, optionally from a byte offset,
//! and give me the headers plus a body stream". That is the [`HttpFetch`]
//! trait; [`ReqwestFetcher`] is the production implementation and tests plug
//! in scripted fakes.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use regex::Regex;
use reqwest::header::{
    HeaderMap, HeaderName, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, USER_AGENT,
};
use reqwest::StatusCode;

use crate::error::{Error, Result};

/// Boxed response body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'static>>;

/// Headers and body of a successful (2xx) response.
pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub content_type: Option<String>,
    pub body: BodyStream,
}

impl FetchResponse {
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// 416 to a range request: the offset is at or past the end.
    pub fn is_range_not_satisfiable(&self) -> bool {
        self.status == 416
    }

    /// Length from a `Content-Range: bytes */<total>` on a 416.
    pub fn unsatisfied_total(&self) -> Option<u64> {
        self.content_range
            .as_deref()
            .and_then(ContentRange::parse_unsatisfied)
    }

    /// Full length of the resource.
    ///
    /// - 206: total from `Content-Range`, else `start + Content-Length`
    /// - otherwise: `Content-Length`
    pub fn total_length(&self, requested_start: u64) -> Option<u64> {
        if self.is_partial() {
            if let Some(range) = self.content_range.as_deref().and_then(ContentRange::parse) {
                return range.total.or(Some(range.end + 1));
            }
            return self.content_length.map(|len| requested_start + len);
        }
        self.content_length
    }

    /// Offset the body starts at. A 200 answer to a range request starts
    /// at 0; callers must skip what they already have.
    pub fn body_start(&self, requested_start: u64) -> u64 {
        if !self.is_partial() {
            return 0;
        }
        self.content_range
            .as_deref()
            .and_then(ContentRange::parse)
            .map(|r| r.start)
            .unwrap_or(requested_start)
    }

    pub fn mime_type(&self) -> Option<String> {
        self.content_type
            .as_deref()
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Parsed `Content-Range: bytes <start>-<end>/<total|*>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let re = Regex::new(r"^\s*bytes\s+(\d+)-(\d+)/(\d+|\*)\s*$").ok()?;
        let caps = re.captures(value)?;
        let start = caps.get(1)?.as_str().parse().ok()?;
        let end = caps.get(2)?.as_str().parse().ok()?;
        let total = match caps.get(3)?.as_str() {
            "*" => None,
            n => Some(n.parse().ok()?),
        };
        if end < start {
            return None;
        }
        Some(Self { start, end, total })
    }

    /// Parse the `bytes */<total>` form sent with a 416.
    pub fn parse_unsatisfied(value: &str) -> Option<u64> {
        let re = Regex::new(r"^\s*bytes\s+\*/(\d+)\s*$").ok()?;
        re.captures(value)?.get(1)?.as_str().parse().ok()
    }
}

/// Minimal HTTP GET abstraction used by the downloader.
pub trait HttpFetch: Send + Sync {
    /// GET `url`. With `range_start = Some(n)` a `Range: bytes=n-` header is
    /// sent. Non-2xx statuses and transport failures are `Error::Network`,
    /// except a 416 to a range request, which is returned with an empty body.
    fn fetch(
        &self,
        url: &str,
        range_start: Option<u64>,
    ) -> impl Future<Output = Result<FetchResponse>> + Send;
}

/// `reqwest`-backed fetcher.
///
/// No request timeout is configured: a stalled read blocks the video's
/// pipeline until the caller pauses or cancels it.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl ReqwestFetcher {
    pub fn new(user_agent: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
        })
    }
}

impl HttpFetch for ReqwestFetcher {
    async fn fetch(&self, url: &str, range_start: Option<u64>) -> Result<FetchResponse> {
        let mut request = self.client.get(url).header(USER_AGENT, &self.user_agent);
        if let Some(start) = range_start {
            request = request.header(RANGE, range_header(start));
        }

        let response = request.send().await?;
        let unsatisfiable =
            range_start.is_some() && response.status() == StatusCode::RANGE_NOT_SATISFIABLE;
        let response = if unsatisfiable {
            response
        } else {
            response.error_for_status()?
        };
        let headers = response.headers();
        let content_length =
            header_string(headers, CONTENT_LENGTH).and_then(|s| s.parse::<u64>().ok());
        let content_range = header_string(headers, CONTENT_RANGE);
        let content_type = header_string(headers, CONTENT_TYPE);
        let status = response.status().as_u16();

        log::debug!(
            "GET {} -> {} (length {:?}, range {:?})",
            url,
            status,
            content_length,
            content_range
        );

        let body: BodyStream = if unsatisfiable {
            Box::pin(futures_util::stream::empty())
        } else {
            Box::pin(response.bytes_stream().map(|piece| piece.map_err(Error::from)))
        };
        Ok(FetchResponse {
            status,
            content_length,
            content_range,
            content_type,
            body,
        })
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// `Range` request header value for resuming at `start`.
pub fn range_header(start: u64) -> String {
    format!("bytes={}-", start)
}
