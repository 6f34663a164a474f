//! Fixed-size pool of frame transform workers.
//!
//! Each job runs on tokio's blocking pool behind a semaphore sized to the
//! configured process count. Workers share nothing with the orchestrator except
//! the filesystem and one multi-producer progress channel.

use std::any::Any;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use anyhow::{bail, Result};
use log::debug;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

use crate::config::RunOptions;
use crate::error::{JobFailure, PipelineError, PipelineResult};

/// One frame to transform
#[derive(Debug, Clone)]
pub struct Job {
    pub index: u32,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub transform_kind: String,
    pub scale_factor: u32,
    pub options: RunOptions,
}

/// Worker to orchestrator notification.
///
/// Events of different jobs interleave freely; a job's own percentages never decrease.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    FrameProgress { index: u32, percent: f64 },
    FrameDone { index: u32, output: PathBuf },
}

/// Value yielded by a frame transform
#[derive(Debug, Clone, PartialEq)]
pub enum TransformStep {
    /// Total work units for this frame; always the first step
    Total(u64),
    /// Cumulative units done so far
    Progress(u64),
    /// Path of the written artifact
    Output(PathBuf),
}

/// Single-image transformation run by the workers.
///
/// The sequence is lazy: work happens as the worker pulls steps.
pub trait FrameTransform: Send + Sync + 'static {
    fn steps<'a>(&'a self, job: &'a Job) -> Box<dyn Iterator<Item = Result<TransformStep>> + 'a>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Succeeded(PathBuf),
    Failed(String),
}

/// Pollable reference to a dispatched job
#[derive(Debug)]
pub struct JobHandle {
    index: u32,
    source: PathBuf,
    outcome: Arc<OnceLock<JobStatus>>,
    task: Option<JoinHandle<()>>,
}

impl JobHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_ready(&self) -> bool {
        self.settled().is_some()
    }

    pub fn status(&self) -> JobStatus {
        self.settled().cloned().unwrap_or(JobStatus::Pending)
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.settled(), Some(JobStatus::Succeeded(_)))
    }

    pub fn failure(&self) -> Option<JobFailure> {
        match self.settled()? {
            JobStatus::Failed(message) => Some(JobFailure {
                index: self.index,
                source: self.source.clone(),
                message: message.clone(),
            }),
            _ => None,
        }
    }

    /// Final outcome by reference, `None` while the job is still running
    fn settled(&self) -> Option<&JobStatus> {
        if let Some(status) = self.outcome.get() {
            return Some(status);
        }
        if !self.task.as_ref().map_or(true, |t| t.is_finished()) {
            return None;
        }
        // the task may have recorded its outcome between the two checks
        Some(self.outcome.get_or_init(|| JobStatus::Failed("worker task ended without reporting".to_string())))
    }

    /// Wait until the job has finished
    pub async fn wait(&mut self) -> JobStatus {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                let _ = self.outcome.set(JobStatus::Failed(format!("worker task ended abnormally: {}", e)));
            }
        }
        self.status()
    }
}

pub struct FramePool {
    size: usize,
    semaphore: Arc<Semaphore>,
    transform: Arc<dyn FrameTransform>,
    events: Option<UnboundedSender<ProgressEvent>>,
    updates_per_frame: u32,
}

impl FramePool {
    pub fn new(
        size: usize,
        transform: Arc<dyn FrameTransform>,
        events: UnboundedSender<ProgressEvent>,
        updates_per_frame: u32,
    ) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            transform,
            events: Some(events),
            updates_per_frame: updates_per_frame.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_none()
    }

    /// Stop accepting jobs. Outstanding jobs keep running; the progress
    /// channel closes once the last of them finishes.
    pub fn close(&mut self) {
        self.events = None;
    }

    /// Queue a job. Must be called from within a tokio runtime.
    pub fn submit(&self, job: Job) -> PipelineResult<JobHandle> {
        let events = self.events.clone().ok_or(PipelineError::PoolClosed)?;
        let outcome = Arc::new(OnceLock::new());
        let index = job.index;
        let source = job.source.clone();

        let semaphore = Arc::clone(&self.semaphore);
        let transform = Arc::clone(&self.transform);
        let updates = self.updates_per_frame;
        let task_outcome = Arc::clone(&outcome);

        let task = tokio::spawn(async move {
            let status = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let blocking = tokio::task::spawn_blocking(move || {
                        run_job(&job, transform.as_ref(), &events, updates)
                    });
                    match blocking.await {
                        Ok(Ok(output)) => JobStatus::Succeeded(output),
                        Ok(Err(e)) => JobStatus::Failed(format!("{:#}", e)),
                        Err(e) => JobStatus::Failed(join_error_message(e)),
                    }
                }
                Err(_) => JobStatus::Failed("worker pool shut down".to_string()),
            };
            let _ = task_outcome.set(status);
        });

        Ok(JobHandle {
            index,
            source,
            outcome,
            task: Some(task),
        })
    }
}

/// Pull the transform's steps to exhaustion, emitting throttled progress.
///
/// A report goes out each time the cumulative work crosses the next multiple
/// of `total / updates_per_frame`, however coarse the transform's steps are.
fn run_job(
    job: &Job,
    transform: &dyn FrameTransform,
    events: &UnboundedSender<ProgressEvent>,
    updates_per_frame: u32,
) -> Result<PathBuf> {
    let mut steps = transform.steps(job);

    let total = match steps.next() {
        Some(Ok(TransformStep::Total(total))) => total.max(1),
        Some(Ok(other)) => bail!("transform must start with a total, got {:?}", other),
        Some(Err(e)) => return Err(e),
        None => bail!("transform produced no steps"),
    };

    let stride = ((total as f64 / updates_per_frame as f64).round() as u64).max(1);
    let mut next_report = stride;
    let mut last_percent = 0.0f64;
    let mut output = None;

    for step in steps {
        match step? {
            TransformStep::Progress(done) => {
                if done >= next_report {
                    next_report = (done / stride + 1) * stride;
                    let percent = (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0).max(last_percent);
                    last_percent = percent;
                    // receiver may be gone after a fail-fast exit
                    let _ = events.send(ProgressEvent::FrameProgress { index: job.index, percent });
                }
            }
            TransformStep::Output(path) => output = Some(path),
            TransformStep::Total(_) => debug!("Ignoring repeated total for frame {}", job.index),
        }
    }

    let output = output.unwrap_or_else(|| job.destination.clone());
    let _ = events.send(ProgressEvent::FrameDone { index: job.index, output: output.clone() });
    Ok(output)
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        format!("worker panicked: {}", panic_payload(err.into_panic()))
    } else {
        err.to_string()
    }
}

fn panic_payload(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
