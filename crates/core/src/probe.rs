//! Probe stage: size and duration of the encoded timelapse.
//!
//! Metadata comes from an `InspectionEngine`; the default one runs ffprobe and
//! parses its JSON output. Values are rendered to display strings here so hosts
//! never format them differently.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw metadata of a media file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub size_bytes: u64,
    pub duration_secs: f64,
}

/// Successful job output, ready for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelapseResult {
    /// Encoded video inside the frame cache
    pub output_path: PathBuf,
    pub size_bytes: u64,
    pub duration_secs: f64,
    /// e.g. `"1.5 MB"`
    pub size_display: String,
    /// e.g. `"12.3 s"`
    pub duration_display: String,
}

impl TimelapseResult {
    pub fn new(output_path: PathBuf, info: MediaInfo) -> Self {
        Self {
            output_path,
            size_bytes: info.size_bytes,
            duration_secs: info.duration_secs,
            size_display: format_size(info.size_bytes),
            duration_display: format_duration(info.duration_secs),
        }
    }
}

/// Reads metadata of a produced file
pub trait InspectionEngine: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

/// `InspectionEngine` running the ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeInspector {
    program: PathBuf,
}

impl FfprobeInspector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl InspectionEngine for FfprobeInspector {
    /// Runs `ffprobe -v quiet -print_format json -show_format <path>`.
    ///
    /// When ffprobe omits the size, the file length on disk is used instead.
    fn inspect(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let output = Command::new(&self.program)
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut info = parse_ffprobe_output(&stdout)?;
        if info.size_bytes == 0 {
            info.size_bytes = std::fs::metadata(path)?.len();
        }
        Ok(info)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Parses ffprobe `-show_format` JSON output into a MediaInfo.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(MediaInfo {
        size_bytes,
        duration_secs,
    })
}

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Render a byte count with binary units.
///
/// The unit is chosen so the displayed number stays below 1024. Bytes are shown
/// as an integer, larger units with one decimal digit: `0 B`, `512 B`, `1.5 KB`.
pub fn format_size(size_bytes: u64) -> String {
    if size_bytes == 0 {
        return "0 B".to_string();
    }

    let mut unit = 0;
    let mut value = size_bytes as f64;
    while unit + 1 < SIZE_UNITS.len() && value >= 1024.0 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        return format!("{} B", size_bytes);
    }

    // 1023.97 KB would print as "1024.0 KB"
    if (value * 10.0).round() / 10.0 >= 1024.0 && unit + 1 < SIZE_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", value, SIZE_UNITS[unit])
}

/// Render a duration truncated (not rounded) to one decimal second: `12.3 s`.
pub fn format_duration(duration_secs: f64) -> String {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return "0.0 s".to_string();
    }
    let tenths = (duration_secs * 10.0 + 1e-9).trunc();
    format!("{:.1} s", tenths / 10.0)
}
