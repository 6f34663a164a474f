//! Seam between the pipeline and the external encoder.
//!
//! The orchestrator only talks to [`MediaTool`]; [`crate::ffmpeg::FfmpegTool`]
//! is the production implementation. Extraction calls run on their own tokio
//! tasks and report completion by returning.

use std::future::Future;
use std::path::Path;

use crate::cache::FrameFormat;
use crate::error::PipelineResult;
use crate::reencode::ReencodeCommand;

pub trait MediaTool: Send + Sync + 'static {
    /// Approximate number of frames the input yields at `frame_rate`.
    ///
    /// Fails with `PipelineError::Estimation` when the source has no readable duration.
    fn estimate_frame_count(
        &self,
        input: &Path,
        frame_rate: f64,
    ) -> impl Future<Output = PipelineResult<u64>> + Send;

    /// Write numbered frames into `destination` as they are decoded
    fn extract_frames(
        &self,
        input: &Path,
        frame_rate: f64,
        format: FrameFormat,
        destination: &Path,
    ) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Write the audio artifact into `destination`; a source without audio writes nothing
    fn extract_audio(
        &self,
        input: &Path,
        destination: &Path,
    ) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Mux processed frames (and audio, if any) into the output video
    fn reencode(&self, command: &ReencodeCommand) -> impl Future<Output = PipelineResult<()>> + Send;
}

/// Frames produced by `duration_secs` of video sampled at `frame_rate`
pub fn frames_for_duration(duration_secs: f64, frame_rate: f64) -> u64 {
    (duration_secs * frame_rate).ceil().max(0.0) as u64
}
