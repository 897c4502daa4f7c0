use url::Url;

/// Best-effort MIME type from a URL's file extension.
///
/// Behavior:
/// - Works on absolute URLs (query and fragment ignored) and on plain paths
/// - Matches the extension case-insensitively
/// - Returns `None` for unknown or missing extensions
pub fn guess_from_url(input: &str) -> Option<&'static str> {
    let path = match Url::parse(input) {
        Ok(url) => url.path().to_string(),
        // Relative or bare paths: drop query/fragment by hand.
        Err(_) => input
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    from_extension(&ext.to_ascii_lowercase())
}

fn from_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "mp4" | "m4v" => "video/mp4",
        "m4a" => "audio/mp4",
        "m4s" => "video/iso.segment",
        "webm" => "video/webm",
        "weba" => "audio/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "ogg" | "oga" => "audio/ogg",
        "ogv" => "video/ogg",
        "opus" => "audio/opus",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "mpd" => "application/dash+xml",
        "m3u8" => "application/vnd.apple.mpegurl",
        "vtt" => "text/vtt",
        "srt" => "application/x-subrip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "json" => "application/json",
        _ => return None,
    })
}

/// Returns `true` for absolute http(s) URLs, the only ones the fetcher accepts.
pub fn is_fetchable(input: &str) -> bool {
    match Url::parse(input.trim()) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}
