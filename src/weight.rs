//! Per-request load weighting.
//!
//! Every request contributes an integer weight to its client's
//! per-minute load. Static assets are nearly free; redirects, POSTs and
//! query-string requests are progressively more expensive, approximating
//! the work they cause behind the front end.

use crate::access_log::AccessRecord;

/// Extensions served from disk without touching the application backend.
/// Frozen by policy; changing this set recalibrates every limit.
pub const STATIC_EXTENSIONS: &[&str] = &[
    // text and data formats
    "css", "map", "js", "json", "xml", "csv", "txt", "pdf",
    // archives
    "7z", "bz2", "gz", "rar", "tar", "xz", "zip",
    // office formats
    "doc", "docx", "odp", "ods", "odt", "ppt", "pptx", "rtf", "xls", "xlsx",
    // images
    "avif", "bmp", "gif", "ico", "jpeg", "jpg", "png", "svg", "tiff", "webp",
    // fonts
    "eot", "otf", "ttf", "woff", "woff2",
    // audio
    "flac", "m4a", "mp3", "ogg", "wav",
    // video
    "avi", "m4v", "mkv", "mov", "mp4", "webm",
];

/// Weight assigned to a single request. First matching rule wins:
/// static extension 1, `3xx` status 10, POST 30, query string 20,
/// anything else 10.
pub fn request_weight(rec: &AccessRecord) -> u64 {
    let (path, is_args) = match rec.uri.split_once('?') {
        Some((path, _)) => (path, true),
        None => (rec.uri.as_str(), false),
    };
    let path = path.to_ascii_lowercase();
    let ext = path.rsplit_once('.').map(|(_, ext)| ext);

    if let Some(ext) = ext {
        if STATIC_EXTENSIONS.contains(&ext) {
            return 1;
        }
    }
    if rec.status.starts_with('3') {
        return 10;
    }
    if rec.method == "POST" {
        return 30;
    }
    if is_args {
        return 20;
    }
    10
}
