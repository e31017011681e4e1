use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

/// Extensions kept as-is when naming the output after a segment.
const MEDIA_EXTENSIONS: [&str; 10] = [
    "ts", "mp4", "m4v", "m4a", "mkv", "mov", "flv", "webm", "aac", "mp3",
];

/// Derives an output file name from a segment URI.
///
/// Takes the last path segment of the URI. Fragmented MP4 pieces (`.m4s`)
/// become `.mp4`; a missing or unknown extension becomes `.ts`.
pub fn output_file_name(uri: &Url) -> String {
    let name = uri
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("output");

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");

    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if MEDIA_EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)) => {
            name.to_string()
        }
        Some(ext) if ext.eq_ignore_ascii_case("m4s") => format!("{stem}.mp4"),
        _ => format!("{stem}.ts"),
    }
}

/// Spawn a task that watches for CTRL + C signal and cancels a [`CancellationToken`] when caught
pub fn spawn_ct_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Caught CTRL+C signal!");
        ct.cancel();
    });
}
