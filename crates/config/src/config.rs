//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Frame cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Staging directory for frames and encoder output (system temp dir if None)
    pub directory: Option<PathBuf>,
    /// JPEG quality used when writing cached frames (1-100, default 80)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_jpeg_quality() -> u8 {
    80
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl CacheConfig {
    /// Resolve the cache directory, falling back to `<temp>/timelapse-cache`
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("timelapse-cache"))
    }

    /// JPEG quality clamped to the range accepted by the encoder
    pub fn effective_jpeg_quality(&self) -> u8 {
        self.jpeg_quality.clamp(1, 100)
    }
}

/// External encoder and inspector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// ffprobe executable
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Video codec passed to `-c:v`
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Extension (container) of the produced video
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
    /// Number of encoder log lines kept as the failure trace
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_output_extension() -> String {
    "mp4".to_string()
}

fn default_log_tail_lines() -> usize {
    64
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            video_codec: default_video_codec(),
            output_extension: default_output_extension(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// Publish (durable copy) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    /// Root directory receiving published timelapses
    #[serde(default = "default_publish_directory")]
    pub directory: PathBuf,
    /// Chunk size used when streaming the cached output (default 1 KiB)
    #[serde(default = "default_copy_buffer_bytes")]
    pub copy_buffer_bytes: usize,
}

fn default_publish_directory() -> PathBuf {
    PathBuf::from("timelapses")
}

fn default_copy_buffer_bytes() -> usize {
    1024
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            directory: default_publish_directory(),
            copy_buffer_bytes: default_copy_buffer_bytes(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub publish: PublishConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TIMELAPSE_CACHE_DIR -> cache.directory
    /// - TIMELAPSE_JPEG_QUALITY -> cache.jpeg_quality
    /// - TIMELAPSE_FFMPEG -> encoder.ffmpeg_path
    /// - TIMELAPSE_FFPROBE -> encoder.ffprobe_path
    /// - TIMELAPSE_VIDEO_CODEC -> encoder.video_codec
    /// - TIMELAPSE_PUBLISH_DIR -> publish.directory
    /// - TIMELAPSE_COPY_BUFFER_BYTES -> publish.copy_buffer_bytes
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_var("TIMELAPSE_CACHE_DIR") {
            self.cache.directory = Some(PathBuf::from(dir));
        }

        if let Ok(val) = env::var("TIMELAPSE_JPEG_QUALITY") {
            if let Ok(quality) = val.parse::<u8>() {
                self.cache.jpeg_quality = quality;
            }
        }

        if let Some(path) = non_empty_var("TIMELAPSE_FFMPEG") {
            self.encoder.ffmpeg_path = PathBuf::from(path);
        }

        if let Some(path) = non_empty_var("TIMELAPSE_FFPROBE") {
            self.encoder.ffprobe_path = PathBuf::from(path);
        }

        if let Some(codec) = non_empty_var("TIMELAPSE_VIDEO_CODEC") {
            self.encoder.video_codec = codec;
        }

        if let Some(dir) = non_empty_var("TIMELAPSE_PUBLISH_DIR") {
            self.publish.directory = PathBuf::from(dir);
        }

        if let Ok(val) = env::var("TIMELAPSE_COPY_BUFFER_BYTES") {
            // A zero-sized buffer would never make progress
            match val.parse::<usize>() {
                Ok(bytes) if bytes > 0 => self.publish.copy_buffer_bytes = bytes,
                _ => {}
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
