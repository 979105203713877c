//! Frame acquisition stage.
//!
//! Pulls every photo through a `PhotoSource` and stores it in the frame cache as
//! `<prefix><index:04>.jpeg`. Frames already on disk are reused, so running the
//! stage twice with the same input only fetches what is missing. Frames beyond
//! the selection, left by a longer earlier job, are removed. A fetch failure
//! aborts the stage and leaves the frames written so far in place; the next run
//! resumes from them.

use crate::frame_cache::{CachedFrame, FrameCache, FrameQuality};
use crate::photo::{FetchError, ImageBuffer, Photo, PhotoSource};
use crate::progress::fraction;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for frame acquisition
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The photo source could not deliver a photo
    #[error("Failed to fetch photo {index} ({url}): {source}")]
    Fetch {
        index: usize,
        url: String,
        #[source]
        source: FetchError,
    },

    /// Reading or writing the frame cache failed
    #[error("Frame cache IO error: {0}")]
    Cache(#[from] io::Error),

    /// A fetched photo could not be written as JPEG
    #[error("Failed to encode frame {index}: {message}")]
    FrameEncode { index: usize, message: String },

    /// Cancellation was requested between two frames
    #[error("Frame acquisition cancelled")]
    Cancelled,
}

/// What a successful acquisition did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquireSummary {
    /// Frames fetched from the photo source
    pub fetched: usize,
    /// Frames already present in the cache
    pub reused: usize,
}

impl AcquireSummary {
    pub fn total(&self) -> usize {
        self.fetched + self.reused
    }
}

/// Parameters of one acquisition run
#[derive(Debug, Clone, Copy)]
pub struct AcquireParams {
    pub quality: FrameQuality,
    /// JPEG quality of written frames (1-100)
    pub jpeg_quality: u8,
}

/// Materialize `photos` as a contiguous frame sequence `0..photos.len()`
///
/// `on_progress` receives `(i + 1) / N` after frame `i` is available, so the last
/// call always reports exactly 1.0. `cancel` is checked before each frame; a fetch
/// already in flight is never interrupted.
pub async fn acquire_frames<F>(
    cache: &FrameCache,
    photos: &[Photo],
    params: AcquireParams,
    source: &dyn PhotoSource,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> Result<AcquireSummary, AcquireError>
where
    F: FnMut(f32),
{
    cache.ensure()?;
    let pruned = cache.prune_from(params.quality, photos.len())?;
    if pruned > 0 {
        debug!(pruned, "removed frames beyond the selection");
    }

    let total = photos.len() as u64;
    let mut summary = AcquireSummary::default();

    for (index, photo) in photos.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            return Err(AcquireError::Cancelled);
        }

        let path = cache.frame_path(params.quality, index);
        match FrameCache::frame_state(&path)? {
            CachedFrame::Valid => {
                debug!(index, path = %path.display(), "reusing cached frame");
                summary.reused += 1;
            }
            state => {
                if state == CachedFrame::Empty {
                    warn!(index, path = %path.display(), "discarding zero-length frame");
                    fs::remove_file(&path)?;
                }

                let url = photo.url_for(params.quality);
                let image = source
                    .fetch(url)
                    .await
                    .map_err(|source| AcquireError::Fetch {
                        index,
                        url: url.to_string(),
                        source,
                    })?;

                write_frame(path, image, params.jpeg_quality, index).await?;
                summary.fetched += 1;
            }
        }

        on_progress(fraction(index as u64 + 1, total));
    }

    Ok(summary)
}

/// Encode and store one frame
///
/// The JPEG lands in a `.part` file first and is renamed into place, so a crash
/// never leaves a truncated frame under the final name.
async fn write_frame(
    path: PathBuf,
    image: ImageBuffer,
    jpeg_quality: u8,
    index: usize,
) -> Result<(), AcquireError> {
    let task = tokio::task::spawn_blocking(move || -> Result<(), AcquireError> {
        let bytes = image
            .encode_jpeg(jpeg_quality)
            .map_err(|e| AcquireError::FrameEncode {
                index,
                message: e.to_string(),
            })?;

        let mut partial = path.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        fs::write(&partial, &bytes)?;
        if let Err(e) = fs::rename(&partial, &path) {
            let _ = fs::remove_file(&partial);
            return Err(AcquireError::Cache(e));
        }

        debug!(index, bytes = bytes.len(), path = %path.display(), "frame written");
        Ok(())
    });

    task.await.map_err(|e| AcquireError::FrameEncode {
        index,
        message: format!("frame writer task failed: {}", e),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory photo source recording every fetched URL
    struct RecordingSource {
        fetched: Mutex<Vec<String>>,
        failing: HashSet<String>,
    }

    impl RecordingSource {
        fn new() -> Self {
            Self {
                fetched: Mutex::new(Vec::new()),
                failing: HashSet::new(),
            }
        }

        fn failing_on(url: &str) -> Self {
            let mut source = Self::new();
            source.failing.insert(url.to_string());
            source
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PhotoSource for RecordingSource {
        async fn fetch(&self, url: &str) -> Result<ImageBuffer, FetchError> {
            self.fetched.lock().unwrap().push(url.to_string());
            if self.failing.contains(url) {
                return Err(FetchError::Source(format!("connection reset for {}", url)));
            }
            Ok(ImageBuffer::new(DynamicImage::new_rgb8(4, 4)))
        }
    }

    fn make_photos(count: usize) -> Vec<Photo> {
        (0..count)
            .map(|i| Photo {
                device_id: 1,
                capture_time: 1_700_000_000_000 - (i as i64) * 60_000,
                file_name: format!("IMG_{:04}.jpg", i),
                full_resolution_url: format!("full/{}", i),
                thumbnail_url: format!("thumb/{}", i),
            })
            .collect()
    }

    fn low_quality() -> AcquireParams {
        AcquireParams {
            quality: FrameQuality::Low,
            jpeg_quality: 80,
        }
    }

    #[tokio::test]
    async fn test_acquire_writes_contiguous_frames() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path().join("cache"));
        let source = RecordingSource::new();
        let cancel = AtomicBool::new(false);
        let mut reported = Vec::new();

        let summary = acquire_frames(&cache, &make_photos(3), low_quality(), &source, &cancel, |p| {
            reported.push(p)
        })
        .await
        .unwrap();

        assert_eq!(summary, AcquireSummary { fetched: 3, reused: 0 });
        for i in 0..3 {
            let path = cache.frame_path(FrameQuality::Low, i);
            assert!(fs::metadata(&path).unwrap().len() > 0);
        }
        assert_eq!(source.fetched(), vec!["thumb/0", "thumb/1", "thumb/2"]);
        assert_eq!(reported.last().copied(), Some(1.0));
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_high_quality_uses_full_resolution_urls() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path());
        let source = RecordingSource::new();
        let cancel = AtomicBool::new(false);
        let params = AcquireParams {
            quality: FrameQuality::High,
            jpeg_quality: 80,
        };

        acquire_frames(&cache, &make_photos(2), params, &source, &cancel, |_| {})
            .await
            .unwrap();

        assert_eq!(source.fetched(), vec!["full/0", "full/1"]);
        assert!(cache.frame_path(FrameQuality::High, 1).exists());
    }

    #[tokio::test]
    async fn test_second_run_reuses_cached_frames() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path());
        let photos = make_photos(4);
        let cancel = AtomicBool::new(false);

        let first = RecordingSource::new();
        acquire_frames(&cache, &photos, low_quality(), &first, &cancel, |_| {})
            .await
            .unwrap();

        let second = RecordingSource::new();
        let summary = acquire_frames(&cache, &photos, low_quality(), &second, &cancel, |_| {})
            .await
            .unwrap();

        assert_eq!(summary, AcquireSummary { fetched: 0, reused: 4 });
        assert!(second.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_refetched() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path());
        cache.ensure().unwrap();
        let stale = cache.frame_path(FrameQuality::Low, 1);
        fs::write(&stale, b"").unwrap();

        let source = RecordingSource::new();
        let cancel = AtomicBool::new(false);
        acquire_frames(&cache, &make_photos(2), low_quality(), &source, &cancel, |_| {})
            .await
            .unwrap();

        assert!(source.fetched().contains(&"thumb/1".to_string()));
        assert!(fs::metadata(&stale).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_previous_frames() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path());
        let source = RecordingSource::failing_on("thumb/2");
        let cancel = AtomicBool::new(false);
        let mut reported = Vec::new();

        let result = acquire_frames(&cache, &make_photos(5), low_quality(), &source, &cancel, |p| {
            reported.push(p)
        })
        .await;

        assert!(matches!(result, Err(AcquireError::Fetch { index: 2, .. })));
        assert!(cache.frame_path(FrameQuality::Low, 0).exists());
        assert!(cache.frame_path(FrameQuality::Low, 1).exists());
        assert!(!cache.frame_path(FrameQuality::Low, 2).exists());
        assert_eq!(reported, vec![0.2, 0.4]);
    }

    #[tokio::test]
    async fn test_shorter_selection_drops_tail_frames() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path());
        let cancel = AtomicBool::new(false);

        let source = RecordingSource::new();
        acquire_frames(&cache, &make_photos(10), low_quality(), &source, &cancel, |_| {})
            .await
            .unwrap();
        let summary = acquire_frames(&cache, &make_photos(6), low_quality(), &source, &cancel, |_| {})
            .await
            .unwrap();

        assert_eq!(summary, AcquireSummary { fetched: 0, reused: 6 });
        assert!(cache.frame_path(FrameQuality::Low, 5).exists());
        assert!(!cache.frame_path(FrameQuality::Low, 6).exists());
        assert!(!cache.frame_path(FrameQuality::Low, 9).exists());
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_before_next_frame() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FrameCache::new(temp_dir.path());
        let source = RecordingSource::new();
        let cancel = AtomicBool::new(true);

        let result =
            acquire_frames(&cache, &make_photos(3), low_quality(), &source, &cancel, |_| {}).await;

        assert!(matches!(result, Err(AcquireError::Cancelled)));
        assert!(source.fetched().is_empty());
    }
}
