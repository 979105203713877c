//! Startup checks module for the timelapse pipeline
//!
//! Provides preflight checks verifying the external tools before a job is started:
//! - ffmpeg is runnable (its major version is reported)
//! - ffprobe is runnable

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Versions reported by the external tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    /// Major ffmpeg version, if it could be parsed
    pub ffmpeg_major: Option<u32>,
    /// First line of `ffprobe -version`
    pub ffprobe_banner: String,
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    // Look for "ffmpeg version" followed by the version string
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    // Extract major version (before first '.' or '-')
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Run `<program> -version` and return its stdout
fn run_version(program: &Path) -> Result<String, String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| format!("{} -version failed; is it installed and in PATH? Error: {}", program.display(), e))?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", program.display(), output.status));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that ffmpeg runs and report its major version
pub fn check_ffmpeg_available(program: &Path) -> Result<Option<u32>, StartupError> {
    let stdout = run_version(program).map_err(StartupError::FfmpegUnavailable)?;
    Ok(parse_ffmpeg_version(&stdout))
}

/// Check that ffprobe runs and return its banner line
pub fn check_ffprobe_available(program: &Path) -> Result<String, StartupError> {
    let stdout = run_version(program).map_err(StartupError::FfprobeUnavailable)?;
    Ok(stdout.lines().next().unwrap_or("(empty)").trim().to_string())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg availability
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<ToolVersions, StartupError> {
    let ffmpeg_major = check_ffmpeg_available(&cfg.encoder.ffmpeg_path)?;
    let ffprobe_banner = check_ffprobe_available(&cfg.encoder.ffprobe_path)?;

    info!(
        ffmpeg = %cfg.encoder.ffmpeg_path.display(),
        ffmpeg_major = ?ffmpeg_major,
        ffprobe = %ffprobe_banner,
        "external tools available"
    );

    Ok(ToolVersions {
        ffmpeg_major,
        ffprobe_banner,
    })
}
