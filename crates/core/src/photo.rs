//! Photo model and photo source collaborators
//!
//! A `Photo` is read-only input supplied by the host. Pixels are fetched on demand
//! through a `PhotoSource` and handed around as an opaque `ImageBuffer`.

use crate::frame_cache::FrameQuality;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Error type for photo retrieval
#[derive(Debug, Error)]
pub enum FetchError {
    /// Nothing exists at the requested location
    #[error("Photo not found: {0}")]
    NotFound(String),

    /// Bytes were retrieved but are not a decodable image
    #[error("Failed to decode photo: {0}")]
    Decode(String),

    /// IO error while reading the photo
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Source-specific failure (network, catalog, ...)
    #[error("Photo source error: {0}")]
    Source(String),
}

/// A single photo captured by a remote camera device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Photo {
    /// Device that captured the photo
    pub device_id: i64,
    /// Capture time as Unix epoch milliseconds
    pub capture_time: i64,
    pub file_name: String,
    pub full_resolution_url: String,
    pub thumbnail_url: String,
}

impl Photo {
    /// URL to fetch for the requested frame quality
    pub fn url_for(&self, quality: FrameQuality) -> &str {
        match quality {
            FrameQuality::High => &self.full_resolution_url,
            FrameQuality::Low => &self.thumbnail_url,
        }
    }
}

/// Decoded image pixels, independent of where they came from
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    image: DynamicImage,
}

impl ImageBuffer {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    /// Decode an encoded image (JPEG, PNG) from memory
    pub fn decode(bytes: &[u8]) -> Result<Self, FetchError> {
        image::load_from_memory(bytes)
            .map(Self::new)
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Encode the pixels as a baseline JPEG at the given quality (1-100)
    ///
    /// Alpha is dropped; the encoder only accepts RGB input.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, ImageError> {
        let rgb = self.image.to_rgb8();
        let mut bytes = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
        encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)?;
        Ok(bytes)
    }
}

/// Retrieves photo pixels by URL
///
/// Implementations may hit the network or a local catalog. A fetch is never
/// interrupted once started; cancellation happens between fetches.
#[async_trait]
pub trait PhotoSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ImageBuffer, FetchError>;
}

/// Photo source reading `file://` URLs or plain filesystem paths
#[derive(Debug, Clone, Default)]
pub struct FilePhotoSource;

impl FilePhotoSource {
    pub fn new() -> Self {
        Self
    }

    /// Map a URL to a local path
    pub fn resolve(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

#[async_trait]
impl PhotoSource for FilePhotoSource {
    async fn fetch(&self, url: &str) -> Result<ImageBuffer, FetchError> {
        let path = Self::resolve(url);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(FetchError::Io(e)),
        };

        tokio::task::spawn_blocking(move || ImageBuffer::decode(&bytes))
            .await
            .map_err(|e| FetchError::Source(format!("decode task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use tempfile::TempDir;

    fn make_photo() -> Photo {
        Photo {
            device_id: 42,
            capture_time: 1_700_000_000_000,
            file_name: "IMG_0001.jpg".to_string(),
            full_resolution_url: "https://camera.local/full/IMG_0001.jpg".to_string(),
            thumbnail_url: "https://camera.local/thumb/IMG_0001.jpg".to_string(),
        }
    }

    #[test]
    fn test_url_for_quality() {
        let photo = make_photo();
        assert_eq!(
            photo.url_for(FrameQuality::High),
            "https://camera.local/full/IMG_0001.jpg"
        );
        assert_eq!(
            photo.url_for(FrameQuality::Low),
            "https://camera.local/thumb/IMG_0001.jpg"
        );
    }

    #[test]
    fn test_encode_jpeg_drops_alpha_and_keeps_dimensions() {
        let buffer = ImageBuffer::new(DynamicImage::ImageRgba8(RgbaImage::new(8, 6)));
        let bytes = buffer.encode_jpeg(80).expect("encode should succeed");

        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

        let decoded = ImageBuffer::decode(&bytes).expect("round trip decode");
        assert_eq!(decoded.width(), 8);
        assert_eq!(decoded.height(), 6);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = ImageBuffer::decode(b"definitely not an image");
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }

    #[test]
    fn test_resolve_strips_file_scheme() {
        assert_eq!(
            FilePhotoSource::resolve("file:///data/photos/a.jpg"),
            PathBuf::from("/data/photos/a.jpg")
        );
        assert_eq!(
            FilePhotoSource::resolve("/data/photos/a.jpg"),
            PathBuf::from("/data/photos/a.jpg")
        );
    }

    #[tokio::test]
    async fn test_file_source_reads_and_decodes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("frame.jpg");
        let bytes = ImageBuffer::new(DynamicImage::new_rgb8(4, 4))
            .encode_jpeg(90)
            .unwrap();
        std::fs::write(&path, bytes).unwrap();

        let url = format!("file://{}", path.display());
        let image = FilePhotoSource::new().fetch(&url).await.unwrap();
        assert_eq!((image.width(), image.height()), (4, 4));
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.jpg");

        let result = FilePhotoSource::new()
            .fetch(path.to_str().unwrap())
            .await;
        assert!(matches!(result, Err(FetchError::NotFound(_))));
    }
}
