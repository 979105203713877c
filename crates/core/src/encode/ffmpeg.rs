//! ffmpeg-backed encoding engine
//!
//! Builds an ffmpeg invocation that turns the cached JPEG sequence into a video,
//! reads `-progress pipe:1` output for the frame counter and forwards stderr to
//! the log sink.

use super::{EncodeOutcome, EncodingEngine, FrameSequence, LogSink, StatisticsSink};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use timelapse_config::EncoderConfig;

/// Scales odd frame sizes down to even ones; yuv420p requires even dimensions
const EVEN_DIMENSIONS_FILTER: &str = "scale=trunc(iw/2)*2:trunc(ih/2)*2";

/// Pixel format accepted by common players
const PIXEL_FORMAT: &str = "yuv420p";

/// How often the child is polled for exit and pending cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Build the ffmpeg command encoding `input` into `output`
///
/// Creates a Command configured with:
/// - image2 input at the sequence frame rate, starting at index 0
/// - Output at the same frame rate with the configured codec, stopping after
///   `frame_count` frames
/// - Even-dimension scaling and yuv420p
/// - Machine-readable progress on stdout
/// - Overwrite of any existing output
pub fn build_ffmpeg_command(
    program: &Path,
    input: &FrameSequence,
    output: &Path,
    video_codec: &str,
) -> Command {
    let rate = input.frame_rate.to_string();
    let mut cmd = Command::new(program);

    cmd.args(["-hide_banner", "-nostdin", "-y"]);

    cmd.arg("-f").arg("image2");
    cmd.arg("-framerate").arg(&rate);
    cmd.arg("-start_number").arg("0");
    cmd.arg("-i").arg(&input.pattern);

    cmd.arg("-r").arg(&rate);
    cmd.arg("-c:v").arg(video_codec);
    cmd.arg("-pix_fmt").arg(PIXEL_FORMAT);
    cmd.arg("-vf").arg(EVEN_DIMENSIONS_FILTER);
    cmd.arg("-frames:v").arg(input.frame_count.to_string());

    cmd.arg("-progress").arg("pipe:1");
    cmd.arg("-nostats");

    cmd.arg(output);

    cmd
}

/// Extract the frame counter from a `-progress` line (`frame=42`)
pub fn parse_progress_line(line: &str) -> Option<u64> {
    line.trim().strip_prefix("frame=")?.trim().parse().ok()
}

/// Classify how the ffmpeg process ended
///
/// * exit code 0 -> `Success`
/// * cancellation requested -> `Cancelled`
/// * other exit code -> `Failed` with the log tail as trace
/// * no exit code (signal) -> `Unknown` carrying the signal number, or -1
pub fn classify_exit(
    code: Option<i32>,
    signal: Option<i32>,
    cancel_requested: bool,
    trace: &str,
) -> EncodeOutcome {
    match code {
        Some(0) => EncodeOutcome::Success,
        _ if cancel_requested => EncodeOutcome::Cancelled,
        Some(code) => EncodeOutcome::Failed(format!(
            "ffmpeg exited with code {}\n{}",
            code,
            trace.trim_end()
        )),
        None => EncodeOutcome::Unknown(signal.unwrap_or(-1)),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, Default)]
struct EngineSlot {
    /// An encode call is in flight
    active: bool,
    /// `cancel()` was called during the current encode
    cancel_requested: bool,
}

/// `EncodingEngine` running the ffmpeg binary
#[derive(Debug)]
pub struct FfmpegEngine {
    program: PathBuf,
    video_codec: String,
    log_tail_lines: usize,
    slot: Mutex<EngineSlot>,
}

impl FfmpegEngine {
    pub fn new(program: impl Into<PathBuf>, video_codec: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            video_codec: video_codec.into(),
            log_tail_lines: 64,
            slot: Mutex::new(EngineSlot::default()),
        }
    }

    pub fn from_config(cfg: &EncoderConfig) -> Self {
        Self::new(&cfg.ffmpeg_path, &cfg.video_codec).with_log_tail(cfg.log_tail_lines)
    }

    /// Number of stderr lines kept as the failure trace
    pub fn with_log_tail(mut self, lines: usize) -> Self {
        self.log_tail_lines = lines.max(1);
        self
    }

    fn lock_slot(&self) -> MutexGuard<'_, EngineSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run(
        &self,
        input: &FrameSequence,
        output: &Path,
        on_statistics: StatisticsSink<'_>,
        on_log: LogSink<'_>,
    ) -> EncodeOutcome {
        let mut cmd = build_ffmpeg_command(&self.program, input, output, &self.video_codec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return EncodeOutcome::Failed(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tail_limit = self.log_tail_lines;

        thread::scope(|scope| {
            let statistics = scope.spawn(move || {
                if let Some(stdout) = stdout {
                    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                        if let Some(frames) = parse_progress_line(&line) {
                            on_statistics(frames);
                        }
                    }
                }
            });

            let logs = scope.spawn(move || {
                let mut tail = VecDeque::with_capacity(tail_limit);
                if let Some(stderr) = stderr {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        on_log(&line);
                        if tail.len() == tail_limit {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
                tail
            });

            let (status, cancel_requested) = self.wait_for_exit(&mut child);
            let _ = statistics.join();
            let trace = logs
                .join()
                .map(|tail| tail.into_iter().collect::<Vec<_>>().join("\n"))
                .unwrap_or_default();

            match status {
                Ok(status) => classify_exit(
                    status.code(),
                    exit_signal(&status),
                    cancel_requested,
                    &trace,
                ),
                Err(e) => EncodeOutcome::Failed(format!("failed to wait for ffmpeg: {}", e)),
            }
        })
    }

    /// Poll the child until it exits, killing it once cancellation is requested
    fn wait_for_exit(&self, child: &mut Child) -> (io::Result<ExitStatus>, bool) {
        let mut killed = false;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return (Ok(status), killed),
                Ok(None) => {}
                Err(e) => return (Err(e), killed),
            }

            if !killed && self.lock_slot().cancel_requested {
                // The child may have exited between try_wait and kill
                let _ = child.kill();
                killed = true;
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl EncodingEngine for FfmpegEngine {
    fn encode(
        &self,
        input: &FrameSequence,
        output: &Path,
        on_statistics: StatisticsSink<'_>,
        on_log: LogSink<'_>,
    ) -> EncodeOutcome {
        {
            let mut slot = self.lock_slot();
            slot.active = true;
            slot.cancel_requested = false;
        }

        let outcome = self.run(input, output, on_statistics, on_log);

        let mut slot = self.lock_slot();
        slot.active = false;
        slot.cancel_requested = false;
        outcome
    }

    fn cancel(&self) {
        let mut slot = self.lock_slot();
        if slot.active {
            slot.cancel_requested = true;
        }
    }
}
