pub mod cache;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod ffprobe;
pub mod media;
pub mod pipeline;
pub mod progress;
pub mod reencode;
pub mod transform;
pub mod worker;

pub use cache::{CacheArea, CacheStore, FrameFormat};
pub use config::{PipelineConfig, RunOptions, RunRequest};
pub use error::{JobFailure, PipelineError, PipelineResult};
pub use ffmpeg::FfmpegTool;
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream};
pub use media::MediaTool;
pub use pipeline::{Pipeline, PipelineStage, PipelineState, RunSummary};
pub use progress::{ChannelProgress, LogProgress, ProgressSink, ProgressUpdate};
pub use transform::BlockMosaic;
pub use worker::{FramePool, FrameTransform, Job, JobHandle, JobStatus, ProgressEvent, TransformStep};
