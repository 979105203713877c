//! Publish stage: durable copy of the cached timelapse.
//!
//! The cached output is streamed in fixed-size chunks into a destination obtained
//! from a `StoragePublisher`. The frame cache itself is never touched here.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// There is no successfully encoded output to publish.
    #[error("No cached timelapse to publish")]
    NoCachedOutput,

    /// The publisher could not provide a destination.
    #[error("No destination available for device {0}")]
    NoDestination(i64),

    /// Streaming the output into the destination failed.
    #[error("Failed to copy timelapse: {0}")]
    CopyFailed(io::Error),
}

/// Opaque destination produced by a `StoragePublisher`
pub trait WriteHandle: Send {
    /// Human-readable location, for logging
    fn location(&self) -> String;

    /// Open the byte stream receiving the video
    fn open(self: Box<Self>) -> io::Result<Box<dyn Write + Send>>;
}

/// Provides durable, device-scoped destinations
pub trait StoragePublisher: Send + Sync {
    /// `None` when no destination can be created
    fn create_destination(&self, device_id: i64) -> Option<Box<dyn WriteHandle>>;
}

/// Check that `path` is a regular file that can be published.
pub fn ensure_cached_output(path: &Path) -> Result<(), PublishError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(PublishError::NoCachedOutput),
    }
}

/// Copy `reader` into `writer` through a `buffer_size` buffer and flush.
///
/// Returns the number of bytes copied.
pub fn copy_in_chunks<R: Read, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..read])?;
        copied += read as u64;
    }
    writer.flush()?;
    Ok(copied)
}

/// Stream the file at `source` into `handle`.
pub fn publish_file(
    source: &Path,
    handle: Box<dyn WriteHandle>,
    buffer_size: usize,
) -> Result<u64, PublishError> {
    let mut reader = File::open(source).map_err(PublishError::CopyFailed)?;
    let mut writer = handle.open().map_err(PublishError::CopyFailed)?;
    copy_in_chunks(&mut reader, writer.as_mut(), buffer_size).map_err(PublishError::CopyFailed)
}

/// Generates the published path for a device.
///
/// The path follows the format: `<root>/device_<id>/timelapse_<timestamp>.<ext>`
/// where timestamp is Unix epoch seconds. A numeric suffix is appended when a
/// file with that name already exists.
pub fn publish_path(root: &Path, device_id: i64, extension: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let dir = root.join(format!("device_{}", device_id));
    let mut candidate = dir.join(format!("timelapse_{}.{}", timestamp, extension));
    let mut suffix = 1;
    while candidate.exists() {
        candidate = dir.join(format!("timelapse_{}_{}.{}", timestamp, suffix, extension));
        suffix += 1;
    }
    candidate
}

/// Publisher writing into a directory tree on the local filesystem
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    root: PathBuf,
    extension: String,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StoragePublisher for DirectoryPublisher {
    fn create_destination(&self, device_id: i64) -> Option<Box<dyn WriteHandle>> {
        let path = publish_path(&self.root, device_id, &self.extension);
        let parent = path.parent()?;
        if let Err(e) = fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "cannot create publish directory");
            return None;
        }
        Some(Box::new(FileWriteHandle { path }))
    }
}

/// Destination backed by a new file
#[derive(Debug)]
pub struct FileWriteHandle {
    path: PathBuf,
}

impl WriteHandle for FileWriteHandle {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn open(self: Box<Self>) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Writer failing after `limit` bytes
    struct FlakyWriter {
        written: usize,
        limit: usize,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written + buf.len() > self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.written += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer recording the size of every write call
    struct ChunkRecorder {
        data: Vec<u8>,
        chunks: Vec<usize>,
    }

    impl Write for ChunkRecorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.chunks.push(buf.len());
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_copy_in_chunks_uses_buffer_size() {
        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut recorder = ChunkRecorder {
            data: Vec::new(),
            chunks: Vec::new(),
        };

        let copied = copy_in_chunks(&mut Cursor::new(&payload), &mut recorder, 1024).unwrap();

        assert_eq!(copied, 2500);
        assert_eq!(recorder.data, payload);
        assert!(recorder.chunks.iter().all(|&c| c <= 1024));
    }

    #[test]
    fn test_copy_in_chunks_surfaces_write_errors() {
        let payload = vec![7u8; 4096];
        let mut writer = FlakyWriter {
            written: 0,
            limit: 2048,
        };
        let result = copy_in_chunks(&mut Cursor::new(&payload), &mut writer, 1024);
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_cached_output() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("timelapse.mp4");

        assert!(matches!(
            ensure_cached_output(&file),
            Err(PublishError::NoCachedOutput)
        ));
        // A directory is not a publishable output
        assert!(matches!(
            ensure_cached_output(temp_dir.path()),
            Err(PublishError::NoCachedOutput)
        ));

        fs::write(&file, b"video").unwrap();
        assert!(ensure_cached_output(&file).is_ok());
    }

    #[test]
    fn test_publish_path_format() {
        let path = publish_path(Path::new("/media/timelapses"), 42, "mp4");
        let path_str = path.to_string_lossy();
        assert!(path_str.starts_with("/media/timelapses/device_42/timelapse_"));
        assert!(path_str.ends_with(".mp4"));
    }

    #[test]
    fn test_publish_path_avoids_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        let first = publish_path(temp_dir.path(), 7, "mp4");
        fs::create_dir_all(first.parent().unwrap()).unwrap();
        fs::write(&first, b"taken").unwrap();

        let second = publish_path(temp_dir.path(), 7, "mp4");
        assert_ne!(first, second);
    }

    #[test]
    fn test_directory_publisher_copies_file() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("timelapse.mp4");
        fs::write(&source, vec![3u8; 5000]).unwrap();

        let publisher = DirectoryPublisher::new(temp_dir.path().join("out"), "mp4");
        let handle = publisher.create_destination(9).expect("destination");
        let location = PathBuf::from(handle.location());

        let copied = publish_file(&source, handle, 1024).unwrap();

        assert_eq!(copied, 5000);
        assert_eq!(fs::read(&location).unwrap(), vec![3u8; 5000]);
        assert!(location.starts_with(temp_dir.path().join("out").join("device_9")));
    }

    #[test]
    fn test_directory_publisher_without_writable_root() {
        let temp_dir = TempDir::new().unwrap();
        // A regular file where the root directory should be
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let publisher = DirectoryPublisher::new(&blocker, "mp4");
        assert!(publisher.create_destination(1).is_none());
    }

    #[test]
    fn test_publish_file_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let publisher = DirectoryPublisher::new(temp_dir.path(), "mp4");
        let handle = publisher.create_destination(1).unwrap();

        let result = publish_file(&temp_dir.path().join("missing.mp4"), handle, 1024);
        assert!(matches!(result, Err(PublishError::CopyFailed(_))));
    }
}
