//! Frame cache for the timelapse pipeline.
//!
//! The cache is a private staging directory holding one JPEG per input photo plus the
//! encoder output. Frame names are deterministic: `<prefix><index:04>.jpeg`, so an
//! interrupted job can resume from the frames already on disk.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File extension of cached frames
pub const FRAME_EXTENSION: &str = "jpeg";

/// Base name of the encoder output inside the cache
pub const OUTPUT_STEM: &str = "timelapse";

/// Which photo rendition a frame was made from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FrameQuality {
    /// Full-resolution photo
    High,
    /// Thumbnail rendition
    Low,
}

impl FrameQuality {
    pub fn from_high_quality(high_quality: bool) -> Self {
        if high_quality {
            FrameQuality::High
        } else {
            FrameQuality::Low
        }
    }

    /// Prefix distinguishing frames of this quality inside the cache
    pub fn prefix(self) -> &'static str {
        match self {
            FrameQuality::High => "hq_",
            FrameQuality::Low => "lq_",
        }
    }
}

/// State of a frame slot on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedFrame {
    /// No file at the frame path
    Missing,
    /// Zero-length file left by an interrupted write
    Empty,
    /// Non-empty file, reusable as-is
    Valid,
}

/// Private on-disk staging area for one creator
#[derive(Debug, Clone)]
pub struct FrameCache {
    root: PathBuf,
}

impl FrameCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the cache directory if it does not exist yet
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    /// File name of frame `index`, e.g. `lq_0007.jpeg`
    pub fn frame_name(quality: FrameQuality, index: usize) -> String {
        format!("{}{:04}.{}", quality.prefix(), index, FRAME_EXTENSION)
    }

    pub fn frame_path(&self, quality: FrameQuality, index: usize) -> PathBuf {
        self.root.join(Self::frame_name(quality, index))
    }

    /// printf-style input pattern understood by the encoder (`<root>/lq_%04d.jpeg`)
    pub fn input_pattern(&self, quality: FrameQuality) -> PathBuf {
        self.root
            .join(format!("{}%04d.{}", quality.prefix(), FRAME_EXTENSION))
    }

    /// Path of the encoder output for the given container extension
    pub fn output_path(&self, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{}", OUTPUT_STEM, extension))
    }

    /// Inspect the frame slot at `path`
    pub fn frame_state(path: &Path) -> io::Result<CachedFrame> {
        match fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => Ok(CachedFrame::Valid),
            Ok(_) => Ok(CachedFrame::Empty),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CachedFrame::Missing),
            Err(e) => Err(e),
        }
    }

    /// Delete frames of `quality` with an index of `first` or above
    ///
    /// Leftovers of a longer earlier job would otherwise extend the sequence the
    /// encoder reads. Returns the number of removed files.
    pub fn prune_from(&self, quality: FrameQuality, first: usize) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(|n| Self::frame_index(quality, n)) else {
                continue;
            };
            if index >= first {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Index encoded in a frame file name of `quality`, if it is one
    fn frame_index(quality: FrameQuality, name: &str) -> Option<usize> {
        let digits = name
            .strip_prefix(quality.prefix())?
            .strip_suffix(FRAME_EXTENSION)?
            .strip_suffix('.')?;
        if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Recursively delete the whole cache directory
    ///
    /// A cache that was never created is not an error.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_frame_name_is_zero_padded() {
        assert_eq!(FrameCache::frame_name(FrameQuality::Low, 7), "lq_0007.jpeg");
        assert_eq!(FrameCache::frame_name(FrameQuality::High, 0), "hq_0000.jpeg");
        assert_eq!(FrameCache::frame_name(FrameQuality::High, 1234), "hq_1234.jpeg");
    }

    #[test]
    fn test_input_pattern_and_output_path() {
        let cache = FrameCache::new("/cache");
        assert_eq!(
            cache.input_pattern(FrameQuality::Low),
            PathBuf::from("/cache/lq_%04d.jpeg")
        );
        assert_eq!(cache.output_path("mp4"), PathBuf::from("/cache/timelapse.mp4"));
    }

    #[test]
    fn test_frame_state_transitions() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path());
        let path = cache.frame_path(FrameQuality::Low, 3);

        assert_eq!(FrameCache::frame_state(&path).unwrap(), CachedFrame::Missing);

        fs::write(&path, b"").unwrap();
        assert_eq!(FrameCache::frame_state(&path).unwrap(), CachedFrame::Empty);

        fs::write(&path, b"jpeg").unwrap();
        assert_eq!(FrameCache::frame_state(&path).unwrap(), CachedFrame::Valid);
    }

    #[test]
    fn test_clear_removes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path().join("cache"));
        cache.ensure().unwrap();
        fs::write(cache.frame_path(FrameQuality::High, 0), b"x").unwrap();

        cache.clear().unwrap();
        assert!(!cache.root().exists());
    }

    #[test]
    fn test_prune_from_removes_only_the_tail() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path());
        for i in 0..10 {
            fs::write(cache.frame_path(FrameQuality::Low, i), b"x").unwrap();
            fs::write(cache.frame_path(FrameQuality::High, i), b"x").unwrap();
        }
        fs::write(cache.output_path("mp4"), b"video").unwrap();

        assert_eq!(cache.prune_from(FrameQuality::Low, 6).unwrap(), 4);

        for i in 0..6 {
            assert!(cache.frame_path(FrameQuality::Low, i).exists());
        }
        for i in 6..10 {
            assert!(!cache.frame_path(FrameQuality::Low, i).exists());
            assert!(cache.frame_path(FrameQuality::High, i).exists());
        }
        assert!(cache.output_path("mp4").exists());
    }

    #[test]
    fn test_prune_from_missing_cache() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path().join("never-created"));
        assert_eq!(cache.prune_from(FrameQuality::Low, 0).unwrap(), 0);
    }

    #[test]
    fn test_clear_without_cache_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path().join("never-created"));
        assert!(cache.clear().is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Frame names sort in sequence order for every index the encoder pattern covers
        #[test]
        fn prop_frame_names_sort_by_index(a in 0usize..10_000, b in 0usize..10_000) {
            let name_a = FrameCache::frame_name(FrameQuality::Low, a);
            let name_b = FrameCache::frame_name(FrameQuality::Low, b);
            prop_assert_eq!(a.cmp(&b), name_a.cmp(&name_b));
        }

        #[test]
        fn prop_frame_index_matches_name(index in 0usize..100_000) {
            let name = FrameCache::frame_name(FrameQuality::High, index);
            prop_assert_eq!(FrameCache::frame_index(FrameQuality::High, &name), Some(index));
            prop_assert_eq!(FrameCache::frame_index(FrameQuality::Low, &name), None);
        }

        #[test]
        fn prop_quality_prefixes_never_collide(index in 0usize..100_000) {
            prop_assert_ne!(
                FrameCache::frame_name(FrameQuality::High, index),
                FrameCache::frame_name(FrameQuality::Low, index)
            );
        }
    }
}
