use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use offline_media::{mime, ByteRange, Config, FileSource, OfflineEvent, OfflineMedia};

#[derive(Debug, Parser)]
#[command(name = "offline-media", version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database location.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Cap on the database size in bytes.
    #[arg(long, global = true)]
    max_bytes: Option<u64>,

    /// Bytes per stored chunk.
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Log filter, e.g. `info` or `offline_media=debug`.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download (or resume) the files of a video and print its events.
    #[command(alias = "dl")]
    Download {
        video_id: String,
        /// File URLs in download order.
        urls: Vec<String>,
    },
    /// List stored videos, most recent first.
    #[command(alias = "ls")]
    List,
    /// Read a stored file back, optionally a byte range of it.
    Read {
        url: String,
        /// `Range` header value, e.g. `bytes=0-1023`.
        #[arg(long)]
        range: Option<String>,
        /// Write the body here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete a video and all its chunks.
    #[command(alias = "rm")]
    Remove { video_id: String },
    /// Delete everything.
    Clear,
}

fn setup_logger(filter: &str) {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .parse_filters(filter)
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Warn)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logger(&cli.log);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(store) = cli.store {
        config = config.with_store_path(store);
    }
    if cli.max_bytes.is_some() {
        config = config.with_max_bytes(cli.max_bytes);
    }
    if let Some(chunk_size) = cli.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }

    let (media, mut events) = OfflineMedia::open(config).context("opening offline store")?;

    match cli.cmd {
        Command::Download { video_id, urls } => {
            if let Some(bad) = urls.iter().find(|u| !mime::is_fetchable(u)) {
                bail!("not an http(s) URL: {}", bad);
            }
            let files = urls.into_iter().map(FileSource::direct).collect();
            media.start_or_resume_download(&video_id, files).await?;
            while let Some(event) = events.recv().await {
                println!("{}", serde_json::to_string(&event)?);
                if event.video_id() == video_id && event.is_terminal() {
                    if let OfflineEvent::DownloadFailed { message, .. } = &event {
                        media.close().await?;
                        bail!("download of {} failed: {}", video_id, message);
                    }
                    break;
                }
            }
        }
        Command::List => {
            for video in media.list_downloads().await? {
                let progress = media.video_progress(&video.video_id).await?;
                let stored = media.stored_bytes(&video.video_id).await?;
                println!(
                    "{}\t{}\t{:.1}%\t{} bytes",
                    video.video_id,
                    if video.done { "done" } else { "partial" },
                    progress.map(|p| p.percent).unwrap_or(0.0),
                    stored
                );
            }
        }
        Command::Read { url, range, out } => {
            let range = range.as_deref().map(ByteRange::parse_header).transpose()?;
            let mut response = media.read_range(&url, range).await?;
            eprintln!("HTTP {}", response.status);
            for (name, value) in &response.headers {
                eprintln!("{}: {}", name, value);
            }

            let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match out {
                Some(path) => Box::new(
                    tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };
            while let Some(piece) = response.body.next().await {
                sink.write_all(&piece?).await?;
            }
            sink.flush().await?;
        }
        Command::Remove { video_id } => {
            media.remove_video(&video_id).await?;
            println!("removed {}", video_id);
        }
        Command::Clear => {
            media.clear_all().await?;
            println!("cleared");
        }
    }

    media.close().await?;
    Ok(())
}
