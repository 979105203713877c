//! Encoding stage for the timelapse pipeline
//!
//! The encoder is an external collaborator behind `EncodingEngine`. A call is
//! synchronous: progress and log lines arrive through the two sinks while it runs,
//! and the terminal state comes back as an `EncodeOutcome`.

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, classify_exit, parse_progress_line, FfmpegEngine};

use std::path::{Path, PathBuf};

/// Terminal state of one engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// Output written
    Success,
    /// Engine reported an error; carries its diagnostic trace
    Failed(String),
    /// Engine stopped because `cancel()` was called
    Cancelled,
    /// Any other terminal state, with the raw code
    Unknown(i32),
}

/// Numbered frame sequence fed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSequence {
    /// printf-style path of the frames, e.g. `/cache/lq_%04d.jpeg`
    pub pattern: PathBuf,
    /// Number of frames, indices `0..frame_count`
    pub frame_count: u64,
    /// Input and output frame rate
    pub frame_rate: u32,
}

/// Receives the "frames encoded so far" counter
pub type StatisticsSink<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Receives diagnostic lines from the engine
pub type LogSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// External video encoder
///
/// `encode` blocks until the engine reaches a terminal state; sinks may be invoked
/// from engine-owned threads. `cancel` may be called from any thread and only
/// affects a call that is in flight.
pub trait EncodingEngine: Send + Sync {
    fn encode(
        &self,
        input: &FrameSequence,
        output: &Path,
        on_statistics: StatisticsSink<'_>,
        on_log: LogSink<'_>,
    ) -> EncodeOutcome;

    fn cancel(&self);
}
