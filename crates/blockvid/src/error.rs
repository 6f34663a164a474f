use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A transform job that ended in failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// Frame index of the failed job
    pub index: u32,
    /// Raw frame the job was reading
    pub source: PathBuf,
    pub message: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {} ({}): {}", self.index, self.source.display(), self.message)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not estimate frame count: {0}")]
    Estimation(String),

    #[error("frame extraction failed: {0}")]
    Extraction(String),

    #[error("frame extraction stalled: no new frame for {secs}s ({observed} frames observed)")]
    ExtractionStalled { secs: u64, observed: usize },

    #[error("{} transform job(s) failed (frames {})", failures.len(), failed_indices(failures))]
    TransformJobs { failures: Vec<JobFailure> },

    #[error("re-encoding failed: {0}")]
    Reencode(String),

    #[error("invalid run options: {0}")]
    InvalidOptions(String),

    #[error("worker pool is closed to new submissions")]
    PoolClosed,

    #[error("cache I/O error: {0}")]
    Cache(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn failed_indices(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .map(|f| f.index.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_failure_lists_every_index() {
        let err = PipelineError::TransformJobs {
            failures: vec![
                JobFailure { index: 7, source: PathBuf::from("file000007.jpg"), message: "boom".into() },
                JobFailure { index: 12, source: PathBuf::from("file000012.jpg"), message: "bad".into() },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 transform job(s) failed"));
        assert!(msg.contains("frames 7, 12"));
    }

    #[test]
    fn test_job_failure_display() {
        let failure = JobFailure { index: 3, source: PathBuf::from("/c/file000003.png"), message: "decode".into() };
        assert_eq!(failure.to_string(), "frame 3 (/c/file000003.png): decode");
    }
}
