//! Timelapse pipeline
//!
//! Turns an ordered photo selection into a video: frames are fetched into an
//! on-disk cache, encoded with an external engine, probed for size and duration
//! and finally published to durable storage on request.

pub mod acquire;
pub mod creator;
pub mod encode;
pub mod frame_cache;
pub mod photo;
pub mod probe;
pub mod progress;
pub mod publish;
pub mod startup;

pub use timelapse_config as config;
pub use timelapse_config::Config;
pub use acquire::{acquire_frames, AcquireError, AcquireParams, AcquireSummary};
pub use creator::{Collaborators, CreatorSettings, TimelapseCreator, TimelapseError};
pub use encode::{
    build_ffmpeg_command, EncodeOutcome, EncodingEngine, FfmpegEngine, FrameSequence,
};
pub use frame_cache::{FrameCache, FrameQuality};
pub use photo::{FetchError, FilePhotoSource, ImageBuffer, Photo, PhotoSource};
pub use probe::{
    format_duration, format_size, FfprobeInspector, InspectionEngine, MediaInfo, ProbeError,
    TimelapseResult,
};
pub use progress::{JobProgress, PipelineState, ProgressHub};
pub use publish::{DirectoryPublisher, PublishError, StoragePublisher, WriteHandle};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError, ToolVersions};
