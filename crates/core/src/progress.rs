//! Progress module for the timelapse pipeline
//!
//! Job progress and pipeline state are published through `tokio::sync::watch`
//! channels: every observer sees the latest consistent snapshot without driving
//! the pipeline, and updates coming from engine threads are applied under the
//! channel lock so a snapshot is never torn.

use crate::probe::TimelapseResult;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Live progress of the current job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct JobProgress {
    /// Fraction of frames materialized in the cache, in [0, 1]
    pub download_progress: f32,
    /// Fraction of frames consumed by the encoder, in [0, 1]
    pub process_progress: f32,
    /// True while the cached output is being published
    pub is_busy: bool,
}

/// Stage of the creator's state machine
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PipelineState {
    /// Nothing running; initial state and the state after `clear()`
    #[default]
    Idle,
    /// Fetching photos into the frame cache
    Acquiring,
    /// Encoder is running
    Encoding,
    /// Reading size/duration of the output
    Probing,
    /// Job finished successfully
    Done(TimelapseResult),
    /// Job failed
    Failed(String),
    /// Job was cancelled
    Cancelled,
}

impl PipelineState {
    /// Convert state to string for logging
    pub fn as_str(&self) -> &str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Acquiring => "acquiring",
            PipelineState::Encoding => "encoding",
            PipelineState::Probing => "probing",
            PipelineState::Done(_) => "done",
            PipelineState::Failed(_) => "failed",
            PipelineState::Cancelled => "cancelled",
        }
    }
}

/// `done / total` clamped to [0, 1]; an empty job reports no progress
pub fn fraction(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0) as f32
}

/// Owner of the progress and state channels
#[derive(Debug)]
pub struct ProgressHub {
    progress: watch::Sender<JobProgress>,
    state: watch::Sender<PipelineState>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(JobProgress::default());
        let (state, _) = watch::channel(PipelineState::Idle);
        Self { progress, state }
    }

    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.progress.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> JobProgress {
        *self.progress.borrow()
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Back to `(0, 0, false)`
    pub fn reset(&self) {
        self.progress.send_replace(JobProgress::default());
    }

    /// Raise download progress; lower values are ignored
    pub fn advance_download(&self, value: f32) {
        let value = value.clamp(0.0, 1.0);
        self.progress.send_if_modified(|p| {
            if value > p.download_progress {
                p.download_progress = value;
                true
            } else {
                false
            }
        });
    }

    /// Raise process progress; lower values are ignored
    pub fn advance_process(&self, value: f32) {
        let value = value.clamp(0.0, 1.0);
        self.progress.send_if_modified(|p| {
            if value > p.process_progress {
                p.process_progress = value;
                true
            } else {
                false
            }
        });
    }

    pub fn set_busy(&self, busy: bool) {
        self.progress.send_if_modified(|p| {
            let changed = p.is_busy != busy;
            p.is_busy = busy;
            changed
        });
    }

    pub fn set_state(&self, state: PipelineState) {
        debug!(state = state.as_str(), "pipeline state changed");
        self.state.send_replace(state);
    }

    /// Mark busy until the returned guard is dropped
    pub fn busy(&self) -> BusyGuard<'_> {
        self.set_busy(true);
        BusyGuard { hub: self }
    }
}

/// Resets `is_busy` when dropped, whichever way the guarded scope exits
#[derive(Debug)]
pub struct BusyGuard<'a> {
    hub: &'a ProgressHub,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.hub.set_busy(false);
    }
}
