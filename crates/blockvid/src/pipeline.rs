//! Frame pipeline orchestrator.
//!
//! Overlaps frame extraction with frame transforms:
//!
//! ```text
//! Init -> ExtractingAndDispatching -> SweepingRemainder -> AwaitingWorkers
//!      -> Reencoding -> Cleanup -> Done
//! ```
//!
//! Any fatal error ends the run in `Failed`. Worker failures are detected at
//! drain-poll boundaries; jobs already running are left to finish on their own.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::cache::{CacheArea, CacheStore, FrameFormat};
use crate::config::{PipelineConfig, RunRequest};
use crate::error::{JobFailure, PipelineError, PipelineResult};
use crate::media::MediaTool;
use crate::progress::{milestone, MilestoneTracker, ProgressSink, ProgressUpdate};
use crate::reencode::ReencodeCommand;
use crate::worker::{FramePool, FrameTransform, Job, JobHandle, ProgressEvent};

/// Upper bound on queued worker events handled before the next readiness check
const MAX_EVENT_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Init,
    ExtractingAndDispatching,
    SweepingRemainder,
    AwaitingWorkers,
    Reencoding,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Init => "init",
            PipelineStage::ExtractingAndDispatching => "extracting+dispatching",
            PipelineStage::SweepingRemainder => "sweeping remainder",
            PipelineStage::AwaitingWorkers => "awaiting workers",
            PipelineStage::Reencoding => "re-encoding",
            PipelineStage::Cleanup => "cleanup",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Counters owned by the orchestrator for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineState {
    /// Duration x frame-rate approximation, never treated as exact
    pub estimated_frame_count: u64,
    pub extraction_complete: bool,
    pub frames_dispatched: usize,
    /// Frames dispatched by the sweep after extraction finished
    pub frames_swept: usize,
    pub frames_completed: usize,
    pub failed_job_indices: BTreeSet<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: PipelineState,
    /// Exact number of extracted frames
    pub frame_count: usize,
    pub had_audio: bool,
    pub output: PathBuf,
}

pub struct Pipeline<M: MediaTool> {
    config: PipelineConfig,
    cache: CacheStore,
    media: Arc<M>,
    transform: Arc<dyn FrameTransform>,
}

impl<M: MediaTool> Pipeline<M> {
    pub fn new(config: PipelineConfig, media: M, transform: impl FrameTransform) -> Self {
        Self::with_shared(config, Arc::new(media), Arc::new(transform))
    }

    pub fn with_shared(config: PipelineConfig, media: Arc<M>, transform: Arc<dyn FrameTransform>) -> Self {
        let cache = CacheStore::new(config.cache_root.clone());
        Self { config, cache, media, transform }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Convert `request.input` into `request.output`.
    ///
    /// Returns once the run is done or has failed. On failure the staging
    /// areas are cleared when `clean_on_failure` is set; jobs still running in
    /// the background may write a few more processed frames afterwards.
    pub async fn run(&self, request: &RunRequest, progress: &dyn ProgressSink) -> PipelineResult<RunSummary> {
        request.options.validate()?;

        let mut ctx = RunContext::new(progress);
        info!("🚀 Run {} started: {} -> {}", ctx.id, request.input.display(), request.output.display());

        match self.run_stages(&mut ctx, request).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                let from = ctx.stage;
                ctx.enter(PipelineStage::Failed);
                error!("❌ Run {} failed during {}: {}", ctx.id, from, e);
                if self.config.clean_on_failure {
                    match self.cache.clear_all() {
                        Ok(removed) => info!("🧹 Cleared {} cached file(s) after failure", removed),
                        Err(clear_err) => warn!("Failed to clear cache after failure: {}", clear_err),
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_stages(&self, ctx: &mut RunContext<'_>, request: &RunRequest) -> PipelineResult<RunSummary> {
        let options = &request.options;
        let format = FrameFormat::from_quality(options.quality);

        // Init: a previous run may have been interrupted before cleaning up
        self.cache.ensure_dirs()?;
        let stale = self.cache.clear_all()?;
        if stale > 0 {
            info!("🧹 Removed {} stale cached file(s)", stale);
        }
        debug!(
            "Run {}: kind={}, scale={}, processes={}, fps={}, quality={}",
            ctx.id, request.transform_kind, request.scale_factor,
            options.process_count, options.frame_rate, options.quality
        );

        let estimated = self.media.estimate_frame_count(&request.input, options.frame_rate).await?;
        if estimated == 0 {
            return Err(PipelineError::Estimation(format!("{} has no frames", request.input.display())));
        }
        ctx.state.estimated_frame_count = estimated;
        ctx.announce(ProgressUpdate::FrameCount { total: estimated, exact: false });
        ctx.milestone(milestone::START);

        let mut extraction = self.spawn_extraction(request, format);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut pool = FramePool::new(
            options.process_count,
            Arc::clone(&self.transform),
            events_tx,
            self.config.progress_updates_per_frame,
        );
        let mut handles: Vec<JobHandle> = Vec::new();
        let mut dispatched: BTreeSet<u32> = BTreeSet::new();

        ctx.enter(PipelineStage::ExtractingAndDispatching);
        self.dispatch_while_extracting(ctx, request, format, &pool, &extraction, &mut handles, &mut dispatched)
            .await?;

        ctx.enter(PipelineStage::SweepingRemainder);
        let frame_count = self
            .sweep_remainder(ctx, request, format, &mut extraction, &pool, &mut handles, &mut dispatched)
            .await?;
        pool.close();
        ctx.milestone(milestone::EXTRACTED);

        ctx.enter(PipelineStage::AwaitingWorkers);
        self.await_workers(ctx, &mut events_rx, &handles).await?;
        ctx.announce(ProgressUpdate::FramesDone { done: handles.len(), total: handles.len() });
        ctx.milestone(milestone::TRANSFORMED);
        info!("✅ Transformed {} frame(s)", ctx.state.frames_completed);

        ctx.enter(PipelineStage::Reencoding);
        let audio = self.cache.audio_artifact()?;
        let had_audio = audio.is_some();
        if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let command = ReencodeCommand::new(&self.cache, audio, options.frame_rate, &self.config, &request.output);
        info!(
            "🎬 Re-encoding {} frame(s) {} audio into {}",
            frame_count,
            if had_audio { "with" } else { "without" },
            request.output.display()
        );
        debug!("Re-encode args: {:?}", command.args());
        self.media.reencode(&command).await?;
        ctx.milestone(milestone::REENCODED);

        ctx.enter(PipelineStage::Cleanup);
        let removed = self.cache.clear_all()?;
        debug!("Removed {} cached file(s)", removed);

        ctx.enter(PipelineStage::Done);
        ctx.milestone(milestone::DONE);
        info!("🏁 Run {} complete: {}", ctx.id, request.output.display());

        Ok(RunSummary {
            run_id: ctx.id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            state: ctx.state.clone(),
            frame_count,
            had_audio,
            output: request.output.clone(),
        })
    }

    fn spawn_extraction(&self, request: &RunRequest, format: FrameFormat) -> ExtractionTasks {
        let media = Arc::clone(&self.media);
        let input = request.input.clone();
        let frame_rate = request.options.frame_rate;
        let frames_dir = self.cache.frames_dir(format);
        let frames = tokio::spawn(async move {
            media.extract_frames(&input, frame_rate, format, &frames_dir).await
        });

        let media = Arc::clone(&self.media);
        let input = request.input.clone();
        let audio_dir = self.cache.dir(CacheArea::Audio);
        let audio = tokio::spawn(async move { media.extract_audio(&input, &audio_dir).await });

        ExtractionTasks { frames, audio }
    }

    fn job_for(&self, request: &RunRequest, format: FrameFormat, index: u32) -> Job {
        Job {
            index,
            source: self.cache.raw_frame_path(index, format),
            destination: self.cache.processed_frame_path(index),
            transform_kind: request.image_transform_kind(),
            scale_factor: request.scale_factor,
            options: request.options.clone(),
        }
    }

    /// Dispatch frames as they appear until the observed count reaches the
    /// threshold share of the estimate or the frame extractor exits
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_while_extracting(
        &self,
        ctx: &mut RunContext<'_>,
        request: &RunRequest,
        format: FrameFormat,
        pool: &FramePool,
        extraction: &ExtractionTasks,
        handles: &mut Vec<JobHandle>,
        dispatched: &mut BTreeSet<u32>,
    ) -> PipelineResult<()> {
        let estimated = ctx.state.estimated_frame_count;
        let threshold = estimated as f64 * self.config.extraction_threshold;
        let stall_window = self.config.extraction_stall();

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_observed = 0usize;
        let mut last_growth = Instant::now();

        loop {
            ticker.tick().await;

            let frames = self.cache.frame_indices(format)?;
            let observed = frames.len();
            for index in frames {
                if dispatched.insert(index) {
                    handles.push(pool.submit(self.job_for(request, format, index))?);
                }
            }
            ctx.state.frames_dispatched = dispatched.len();
            ctx.milestone((observed as f64 / estimated as f64).min(milestone::EXTRACTED));

            if observed as f64 >= threshold {
                debug!("Observed {} of ~{} frames, leaving dispatch phase", observed, estimated);
                return Ok(());
            }
            if extraction.frames.is_finished() {
                info!("Frame extraction exited after {} of ~{} frames", observed, estimated);
                return Ok(());
            }

            if observed > last_observed {
                last_observed = observed;
                last_growth = Instant::now();
            } else if let Some(window) = stall_window {
                if last_growth.elapsed() >= window {
                    return Err(PipelineError::ExtractionStalled { secs: window.as_secs(), observed });
                }
            }
        }
    }

    /// Wait for both extractors, then dispatch every frame the first phase missed.
    /// Returns the exact frame count.
    #[allow(clippy::too_many_arguments)]
    async fn sweep_remainder(
        &self,
        ctx: &mut RunContext<'_>,
        request: &RunRequest,
        format: FrameFormat,
        extraction: &mut ExtractionTasks,
        pool: &FramePool,
        handles: &mut Vec<JobHandle>,
        dispatched: &mut BTreeSet<u32>,
    ) -> PipelineResult<usize> {
        let (frames_result, audio_result) = extraction.join().await;
        flatten_join(frames_result, "frame extraction")?;
        if let Err(e) = flatten_join(audio_result, "audio extraction") {
            warn!("⚠️  Audio extraction failed, continuing without audio: {}", e);
            self.cache.clear(CacheArea::Audio)?;
        }
        ctx.state.extraction_complete = true;
        info!("📼 Extraction finished");

        let frames = self.cache.frame_indices(format)?;
        if frames.is_empty() {
            return Err(PipelineError::Extraction(format!(
                "no frames were extracted from {}",
                request.input.display()
            )));
        }
        let processed = self.cache.processed_indices()?;
        ctx.announce(ProgressUpdate::FrameCount { total: frames.len() as u64, exact: true });

        let remaining: Vec<u32> = frames
            .iter()
            .copied()
            .filter(|index| !dispatched.contains(index) && !processed.contains(index))
            .collect();
        debug!("Sweeping {} frame(s) that arrived after the dispatch phase", remaining.len());

        for index in remaining {
            dispatched.insert(index);
            handles.push(pool.submit(self.job_for(request, format, index))?);
            ctx.state.frames_swept += 1;
        }
        ctx.state.frames_dispatched = dispatched.len();
        Ok(frames.len())
    }

    /// Drain worker events until every handle is ready; fail fast on the first failures seen.
    ///
    /// Handles are rescanned after a completion event, a quiet period, or at
    /// least once per poll interval, and only those not yet seen as ready.
    async fn await_workers(
        &self,
        ctx: &mut RunContext<'_>,
        events: &mut mpsc::UnboundedReceiver<ProgressEvent>,
        handles: &[JobHandle],
    ) -> PipelineResult<()> {
        let total = handles.len();
        let scan_interval = self.config.poll_interval();
        let recount_interval = scan_interval * self.config.recount_every.max(1);
        let mut pending: Vec<usize> = (0..total).collect();
        let mut channel_open = true;
        let mut last_scan = Instant::now();
        let mut last_recount = Instant::now();

        while !pending.is_empty() {
            let mut rescan = false;
            if channel_open {
                match timeout(self.config.drain_timeout(), events.recv()).await {
                    Ok(Some(event)) => {
                        rescan |= ctx.forward(event, total);
                        for _ in 0..MAX_EVENT_BATCH {
                            match events.try_recv() {
                                Ok(event) => rescan |= ctx.forward(event, total),
                                Err(mpsc::error::TryRecvError::Empty) => break,
                                Err(mpsc::error::TryRecvError::Disconnected) => {
                                    channel_open = false;
                                    rescan = true;
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        channel_open = false;
                        rescan = true;
                    }
                    Err(_) => {
                        debug!("No worker event within {:?}", self.config.drain_timeout());
                        rescan = true;
                    }
                }
            } else {
                tokio::time::sleep(scan_interval).await;
                rescan = true;
            }

            if rescan || last_scan.elapsed() >= scan_interval {
                last_scan = Instant::now();
                let mut failures: Vec<JobFailure> = Vec::new();
                pending.retain(|&i| {
                    let handle = &handles[i];
                    if !handle.is_ready() {
                        return true;
                    }
                    failures.extend(handle.failure());
                    false
                });

                if !failures.is_empty() {
                    error!("❌ {} transform job(s) failed", failures.len());
                    for failure in &failures {
                        error!("   {}", failure);
                        ctx.state.failed_job_indices.insert(failure.index);
                    }
                    return Err(PipelineError::TransformJobs { failures });
                }
            }

            // event cadence is best effort; the directory is the ground truth
            if !pending.is_empty() && last_recount.elapsed() >= recount_interval {
                last_recount = Instant::now();
                let done = self.cache.processed_indices()?.len();
                ctx.announce(ProgressUpdate::FramesDone { done, total });
            }
        }
        info!("All {} job(s) are complete", total);

        while let Ok(event) = events.try_recv() {
            ctx.forward(event, total);
        }
        ctx.state.frames_completed = handles.iter().filter(|h| h.succeeded()).count();
        Ok(())
    }
}

struct ExtractionTasks {
    frames: JoinHandle<PipelineResult<()>>,
    audio: JoinHandle<PipelineResult<()>>,
}

impl ExtractionTasks {
    async fn join(
        &mut self,
    ) -> (
        Result<PipelineResult<()>, JoinError>,
        Result<PipelineResult<()>, JoinError>,
    ) {
        let frames = (&mut self.frames).await;
        let audio = (&mut self.audio).await;
        (frames, audio)
    }
}

impl Drop for ExtractionTasks {
    // an abandoned run must not leave encoder processes behind
    fn drop(&mut self) {
        self.frames.abort();
        self.audio.abort();
    }
}

fn flatten_join(result: Result<PipelineResult<()>, JoinError>, what: &str) -> PipelineResult<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(PipelineError::Extraction(format!("{} task ended abnormally: {}", what, e))),
    }
}

struct RunContext<'a> {
    id: Uuid,
    started_at: DateTime<Utc>,
    stage: PipelineStage,
    state: PipelineState,
    milestones: MilestoneTracker,
    progress: &'a dyn ProgressSink,
    frames_done_events: usize,
}

impl<'a> RunContext<'a> {
    fn new(progress: &'a dyn ProgressSink) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            stage: PipelineStage::Init,
            state: PipelineState::default(),
            milestones: MilestoneTracker::new(),
            progress,
            frames_done_events: 0,
        }
    }

    fn enter(&mut self, stage: PipelineStage) {
        debug!("Run {}: {} -> {}", self.id, self.stage, stage);
        self.stage = stage;
    }

    fn announce(&self, update: ProgressUpdate) {
        self.progress.announce(update);
    }

    fn milestone(&mut self, value: f64) {
        if let Some(value) = self.milestones.advance(value) {
            self.progress.announce(ProgressUpdate::Milestone(value));
        }
    }

    /// Relay a worker event; true when it reports a finished frame
    fn forward(&mut self, event: ProgressEvent, total: usize) -> bool {
        match event {
            ProgressEvent::FrameProgress { index, percent } => {
                self.progress.announce(ProgressUpdate::FramePercent { index, percent });
                false
            }
            ProgressEvent::FrameDone { index, output } => {
                self.frames_done_events += 1;
                debug!("Frame {} done: {}", index, output.display());
                self.progress.announce(ProgressUpdate::FramesDone { done: self.frames_done_events, total });
                true
            }
        }
    }
}
