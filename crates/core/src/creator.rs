//! Timelapse creator: the orchestrator of the pipeline
//!
//! Sequences frame acquisition, encoding and probing for one job at a time, owns
//! the live progress/state channels and publishes the last successful result on
//! request.

use crate::acquire::{acquire_frames, AcquireError, AcquireParams};
use crate::config::Config;
use crate::encode::{EncodeOutcome, EncodingEngine, FfmpegEngine, FrameSequence};
use crate::frame_cache::{FrameCache, FrameQuality};
use crate::photo::{FetchError, FilePhotoSource, Photo, PhotoSource};
use crate::probe::{FfprobeInspector, InspectionEngine, ProbeError, TimelapseResult};
use crate::progress::{fraction, JobProgress, PipelineState, ProgressHub};
use crate::publish::{
    ensure_cached_output, publish_file, DirectoryPublisher, PublishError, StoragePublisher,
};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// How often a pending cancel is re-sent to a running engine
const CANCEL_FORWARD_INTERVAL: Duration = Duration::from_millis(25);

/// Error type returned by every creator operation
#[derive(Debug, Error)]
pub enum TimelapseError {
    /// The request cannot be processed as given
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Another create or save is running on this creator
    #[error("Another timelapse operation is already running")]
    Busy,

    /// A photo could not be fetched; frames fetched before it stay cached
    #[error("Failed to fetch photo {index} ({url}): {source}")]
    FetchFailure {
        index: usize,
        url: String,
        #[source]
        source: FetchError,
    },

    /// Reading or writing the frame cache failed
    #[error("Frame cache IO error: {0}")]
    Cache(io::Error),

    /// A fetched photo could not be written as a frame
    #[error("Failed to write frame: {0}")]
    FrameEncode(String),

    /// The encoder reported an error
    #[error("Encoding failed: {0}")]
    EncodeFailure(String),

    /// The job was cancelled, between frames or during encoding
    #[error("Timelapse job cancelled")]
    Cancelled,

    /// The encoder ended in a state that is neither success, failure nor cancellation
    #[error("Encoder ended in unknown state (code {0})")]
    EncodeUnknown(i32),

    /// The encoded output could not be inspected
    #[error("Failed to inspect timelapse: {0}")]
    ProbeFailure(#[from] ProbeError),

    /// No successfully encoded output is cached
    #[error("No cached timelapse to publish")]
    NoCachedOutput,

    /// The publisher could not provide a destination
    #[error("No destination available for device {0}")]
    NoDestination(i64),

    /// Streaming the output to its destination failed
    #[error("Failed to copy timelapse: {0}")]
    CopyFailure(io::Error),

    /// A background task panicked or was aborted
    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<AcquireError> for TimelapseError {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::Fetch { index, url, source } => {
                TimelapseError::FetchFailure { index, url, source }
            }
            AcquireError::Cache(e) => TimelapseError::Cache(e),
            AcquireError::FrameEncode { index, message } => {
                TimelapseError::FrameEncode(format!("frame {}: {}", index, message))
            }
            AcquireError::Cancelled => TimelapseError::Cancelled,
        }
    }
}

impl From<PublishError> for TimelapseError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::NoCachedOutput => TimelapseError::NoCachedOutput,
            PublishError::NoDestination(device_id) => TimelapseError::NoDestination(device_id),
            PublishError::CopyFailed(e) => TimelapseError::CopyFailure(e),
        }
    }
}

/// Tunables of the creator
#[derive(Debug, Clone, PartialEq)]
pub struct CreatorSettings {
    /// JPEG quality of cached frames (1-100)
    pub jpeg_quality: u8,
    /// Container extension of the encoder output
    pub output_extension: String,
    /// Chunk size of the publish copy
    pub copy_buffer_bytes: usize,
}

impl Default for CreatorSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            output_extension: "mp4".to_string(),
            copy_buffer_bytes: 1024,
        }
    }
}

impl CreatorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            jpeg_quality: cfg.cache.effective_jpeg_quality(),
            output_extension: cfg.encoder.output_extension.clone(),
            copy_buffer_bytes: cfg.publish.copy_buffer_bytes.max(1),
        }
    }
}

/// External collaborators driven by the creator
#[derive(Clone)]
pub struct Collaborators {
    pub photo_source: Arc<dyn PhotoSource>,
    pub engine: Arc<dyn EncodingEngine>,
    pub inspector: Arc<dyn InspectionEngine>,
    pub publisher: Arc<dyn StoragePublisher>,
}

impl Collaborators {
    /// Local files in, ffmpeg/ffprobe for encoding, publish into a directory tree
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            photo_source: Arc::new(FilePhotoSource::new()),
            engine: Arc::new(FfmpegEngine::from_config(&cfg.encoder)),
            inspector: Arc::new(FfprobeInspector::new(&cfg.encoder.ffprobe_path)),
            publisher: Arc::new(DirectoryPublisher::new(
                &cfg.publish.directory,
                &cfg.encoder.output_extension,
            )),
        }
    }
}

/// Orchestrator of the timelapse pipeline
///
/// Only one create or save runs at a time: a second call while one is active
/// fails with `TimelapseError::Busy` instead of queueing.
pub struct TimelapseCreator {
    cache: FrameCache,
    settings: CreatorSettings,
    collaborators: Collaborators,
    /// Single permit shared by create, save and clear
    permit: Semaphore,
    cancel_requested: AtomicBool,
    hub: Arc<ProgressHub>,
    last_result: Mutex<Option<TimelapseResult>>,
}

impl TimelapseCreator {
    /// Create a creator with default settings
    pub fn new(cache: FrameCache, collaborators: Collaborators) -> Self {
        Self::with_settings(cache, collaborators, CreatorSettings::default())
    }

    pub fn with_settings(
        cache: FrameCache,
        collaborators: Collaborators,
        settings: CreatorSettings,
    ) -> Self {
        Self {
            cache,
            settings,
            collaborators,
            permit: Semaphore::new(1),
            cancel_requested: AtomicBool::new(false),
            hub: Arc::new(ProgressHub::new()),
            last_result: Mutex::new(None),
        }
    }

    /// Build a creator with the built-in collaborators described by `cfg`
    pub fn from_config(cfg: &Config) -> Self {
        Self::with_settings(
            FrameCache::new(cfg.cache.resolved_directory()),
            Collaborators::from_config(cfg),
            CreatorSettings::from_config(cfg),
        )
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn settings(&self) -> &CreatorSettings {
        &self.settings
    }

    /// Live progress stream; every receiver sees the latest snapshot
    pub fn subscribe_progress(&self) -> watch::Receiver<JobProgress> {
        self.hub.subscribe()
    }

    /// Live pipeline state stream
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.hub.subscribe_state()
    }

    pub fn progress(&self) -> JobProgress {
        self.hub.snapshot()
    }

    pub fn state(&self) -> PipelineState {
        self.hub.state()
    }

    pub fn is_busy(&self) -> bool {
        self.hub.snapshot().is_busy
    }

    pub fn download_progress(&self) -> f32 {
        self.hub.snapshot().download_progress
    }

    pub fn process_progress(&self) -> f32 {
        self.hub.snapshot().process_progress
    }

    /// Result of the last successful job, until the next job starts or `clear()`
    pub fn last_result(&self) -> Option<TimelapseResult> {
        self.lock_last_result().clone()
    }

    fn lock_last_result(&self) -> MutexGuard<'_, Option<TimelapseResult>> {
        self.last_result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch, encode and probe `photos` as one timelapse
    ///
    /// Frames are numbered in the order of `photos`. Progress is reset to zero
    /// when the job starts.
    pub async fn create_timelapse(
        &self,
        photos: &[Photo],
        high_quality: bool,
        frame_rate: u32,
    ) -> Result<TimelapseResult, TimelapseError> {
        let _permit = self.permit.try_acquire().map_err(|_| TimelapseError::Busy)?;

        if photos.is_empty() {
            return Err(TimelapseError::InvalidRequest(
                "no photos selected".to_string(),
            ));
        }
        if frame_rate == 0 {
            return Err(TimelapseError::InvalidRequest(
                "frame rate must be at least 1".to_string(),
            ));
        }

        let job_id = Uuid::new_v4();
        let span = info_span!(
            "timelapse_job",
            %job_id,
            frames = photos.len(),
            high_quality,
            frame_rate
        );

        self.run_job(photos, FrameQuality::from_high_quality(high_quality), frame_rate)
            .instrument(span)
            .await
    }

    async fn run_job(
        &self,
        photos: &[Photo],
        quality: FrameQuality,
        frame_rate: u32,
    ) -> Result<TimelapseResult, TimelapseError> {
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.hub.reset();
        *self.lock_last_result() = None;

        let outcome = self.run_stages(photos, quality, frame_rate).await;

        match &outcome {
            Ok(result) => {
                info!(
                    output = %result.output_path.display(),
                    size = %result.size_display,
                    duration = %result.duration_display,
                    "timelapse ready"
                );
                *self.lock_last_result() = Some(result.clone());
                self.hub.set_state(PipelineState::Done(result.clone()));
            }
            Err(TimelapseError::Cancelled) => {
                info!("timelapse job cancelled");
                self.hub.set_state(PipelineState::Cancelled);
            }
            Err(e) => {
                warn!(error = %e, "timelapse job failed");
                self.hub.set_state(PipelineState::Failed(e.to_string()));
            }
        }

        outcome
    }

    async fn run_stages(
        &self,
        photos: &[Photo],
        quality: FrameQuality,
        frame_rate: u32,
    ) -> Result<TimelapseResult, TimelapseError> {
        self.hub.set_state(PipelineState::Acquiring);
        info!(cache = %self.cache.root().display(), "acquiring frames");

        let params = AcquireParams {
            quality,
            jpeg_quality: self.settings.jpeg_quality,
        };
        let hub = &self.hub;
        let summary = acquire_frames(
            &self.cache,
            photos,
            params,
            self.collaborators.photo_source.as_ref(),
            &self.cancel_requested,
            |value| hub.advance_download(value),
        )
        .await?;
        info!(
            frames = summary.total(),
            fetched = summary.fetched,
            reused = summary.reused,
            "frames ready"
        );

        if self.cancel_requested.load(Ordering::SeqCst) {
            return Err(TimelapseError::Cancelled);
        }

        self.hub.set_state(PipelineState::Encoding);
        let output = self
            .encode(quality, photos.len() as u64, frame_rate)
            .await?;

        self.hub.set_state(PipelineState::Probing);
        let inspector = Arc::clone(&self.collaborators.inspector);
        let target = output.clone();
        let info = tokio::task::spawn_blocking(move || inspector.inspect(&target))
            .await
            .map_err(|e| TimelapseError::Task(format!("inspection task failed: {}", e)))??;

        // Inspection itself is not interruptible; a cancel during it still ends the job
        if self.cancel_requested.load(Ordering::SeqCst) {
            return Err(TimelapseError::Cancelled);
        }

        Ok(TimelapseResult::new(output, info))
    }

    /// Run the engine over the cached frames and classify its outcome
    async fn encode(
        &self,
        quality: FrameQuality,
        frame_count: u64,
        frame_rate: u32,
    ) -> Result<PathBuf, TimelapseError> {
        let output = self.cache.output_path(&self.settings.output_extension);
        match fs::remove_file(&output) {
            Ok(()) => debug!(output = %output.display(), "removed stale output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(TimelapseError::Cache(e)),
        }

        let input = FrameSequence {
            pattern: self.cache.input_pattern(quality),
            frame_count,
            frame_rate,
        };
        info!(input = %input.pattern.display(), "encoding");

        let engine = Arc::clone(&self.collaborators.engine);
        let hub = Arc::clone(&self.hub);
        let target = output.clone();
        let span = Span::current();

        let mut task = tokio::task::spawn_blocking(move || {
            let on_statistics =
                |frames: u64| hub.advance_process(fraction(frames, frame_count));
            let on_log = |line: &str| {
                span.in_scope(|| debug!(target: "timelapse::engine", "{}", line));
            };
            engine.encode(&input, &target, &on_statistics, &on_log)
        });

        // The engine only honors a cancel once its call is in flight, so a pending
        // request is forwarded again until the call returns.
        let mut ticker = tokio::time::interval(CANCEL_FORWARD_INTERVAL);
        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = ticker.tick() => {
                    if self.cancel_requested.load(Ordering::SeqCst) {
                        self.collaborators.engine.cancel();
                    }
                }
            }
        };
        let outcome =
            joined.map_err(|e| TimelapseError::Task(format!("encoder task failed: {}", e)))?;

        if self.cancel_requested.load(Ordering::SeqCst) {
            return Err(TimelapseError::Cancelled);
        }

        match outcome {
            EncodeOutcome::Success => {
                self.hub.advance_process(1.0);
                Ok(output)
            }
            EncodeOutcome::Failed(trace) => Err(TimelapseError::EncodeFailure(trace)),
            EncodeOutcome::Cancelled => Err(TimelapseError::Cancelled),
            EncodeOutcome::Unknown(code) => Err(TimelapseError::EncodeUnknown(code)),
        }
    }

    /// Copy the last successful output to a durable location for `device_id`
    ///
    /// `is_busy` is true for the duration of the copy and reset on every exit path.
    pub async fn save_timelapse(&self, device_id: i64) -> Result<(), TimelapseError> {
        let _permit = self.permit.try_acquire().map_err(|_| TimelapseError::Busy)?;

        let output = self
            .last_result()
            .map(|result| result.output_path)
            .ok_or(TimelapseError::NoCachedOutput)?;
        ensure_cached_output(&output)?;

        let handle = self
            .collaborators
            .publisher
            .create_destination(device_id)
            .ok_or(TimelapseError::NoDestination(device_id))?;
        let location = handle.location();

        let _busy = self.hub.busy();
        let buffer_size = self.settings.copy_buffer_bytes;
        let copied =
            tokio::task::spawn_blocking(move || publish_file(&output, handle, buffer_size))
                .await
                .map_err(|e| TimelapseError::Task(format!("publish task failed: {}", e)))??;

        info!(device_id, %location, bytes = copied, "timelapse published");
        Ok(())
    }

    /// Request cancellation of the running job
    ///
    /// Acquisition stops before its next frame; a running encode is cancelled
    /// through the engine. Without a running job this does nothing.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if matches!(self.hub.state(), PipelineState::Encoding) {
            self.collaborators.engine.cancel();
        }
    }

    /// Delete the frame cache and return to `Idle`
    ///
    /// A running job is cancelled first and awaited, so the cache is never
    /// deleted underneath it.
    pub async fn clear(&self) {
        self.cancel();
        let _permit = match self.permit.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.clear()).await {
            Ok(Ok(())) => debug!(cache = %self.cache.root().display(), "frame cache cleared"),
            Ok(Err(e)) => warn!(cache = %self.cache.root().display(), error = %e, "failed to clear frame cache"),
            Err(e) => warn!(error = %e, "frame cache cleanup task failed"),
        }

        *self.lock_last_result() = None;
        self.hub.reset();
        self.hub.set_state(PipelineState::Idle);
    }
}
