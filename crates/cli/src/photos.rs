//! Photo discovery for the CLI host.
//!
//! Turns a directory of image files into the ordered `Photo` list the creator
//! expects. Frame order is file-name order.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use timelapse_core::Photo;
use walkdir::WalkDir;

/// Image file extensions picked up by the scanner (case-insensitive matching).
pub const PHOTO_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png"];

/// Checks if a file has a photo extension (case-insensitive).
pub fn is_photo_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            PHOTO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// `file://` URL of a local path
pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Scans `dir` (not recursively) for photos, sorted by file name.
///
/// Hidden files are skipped. Both renditions of a local photo point at the
/// same file; the capture time is the file's modification time.
pub fn scan_photos(dir: &Path, device_id: i64) -> Result<Vec<Photo>, walkdir::Error> {
    let mut photos = Vec::new();

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with('.') || !is_photo_file(entry.path()) {
            continue;
        }

        let path = absolute(entry.path());
        let capture_time = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let url = file_url(&path);
        photos.push(Photo {
            device_id,
            capture_time,
            file_name,
            full_resolution_url: url.clone(),
            thumbnail_url: url,
        });
    }

    Ok(photos)
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
