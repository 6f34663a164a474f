use log::{debug, info};
use tokio::sync::mpsc;

/// Coarse checkpoints on a 0–2 scale; only their order is meaningful
pub mod milestone {
    pub const START: f64 = 0.0;
    /// Extraction finished and every frame dispatched
    pub const EXTRACTED: f64 = 1.0;
    /// Every frame transformed
    pub const TRANSFORMED: f64 = 1.4;
    pub const REENCODED: f64 = 1.8;
    pub const DONE: f64 = 2.0;
}

/// Notification for the progress display
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Frame count; `exact` is false while it is still an estimate
    FrameCount { total: u64, exact: bool },
    /// Overall milestone value
    Milestone(f64),
    /// Percentage of one frame's transform. Frames run in parallel, so
    /// consumers track each `index` separately.
    FramePercent { index: u32, percent: f64 },
    /// Transformed frames so far
    FramesDone { done: usize, total: usize },
}

pub trait ProgressSink: Send + Sync {
    fn announce(&self, update: ProgressUpdate);
}

/// Writes updates to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn announce(&self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::FrameCount { total, exact: false } => info!("🎞️  ~{} frames expected", total),
            ProgressUpdate::FrameCount { total, exact: true } => info!("🎞️  {} frames extracted", total),
            ProgressUpdate::Milestone(value) => info!("📈 Progress {:.2}/{:.1}", value, milestone::DONE),
            ProgressUpdate::FramePercent { index, percent } => debug!("Frame {} at {:.0}%", index, percent),
            ProgressUpdate::FramesDone { done, total } => info!("🧱 {}/{} frames transformed", done, total),
        }
    }
}

/// Forwards updates to an external display over a channel
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn announce(&self, update: ProgressUpdate) {
        // a display that went away does not stop the run
        let _ = self.tx.send(update);
    }
}

/// Keeps announced milestones non-decreasing within one run
#[derive(Debug, Default)]
pub struct MilestoneTracker {
    last: Option<f64>,
}

impl MilestoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }

    /// Value to announce, or `None` if it would not move the needle forward
    pub fn advance(&mut self, value: f64) -> Option<f64> {
        if !value.is_finite() {
            return None;
        }
        let value = value.clamp(milestone::START, milestone::DONE);
        match self.last {
            Some(last) if value <= last => None,
            _ => {
                self.last = Some(value);
                Some(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_milestone_is_always_announced() {
        let mut tracker = MilestoneTracker::new();
        assert_eq!(tracker.advance(milestone::START), Some(0.0));
        assert_eq!(tracker.advance(milestone::START), None);
        assert_eq!(tracker.advance(0.5), Some(0.5));
        assert_eq!(tracker.advance(0.4), None);
        assert_eq!(tracker.advance(milestone::DONE + 1.0), Some(2.0));
        assert_eq!(tracker.last(), Some(2.0));
    }

    #[test]
    fn test_channel_progress_survives_dropped_receiver() {
        let (sink, rx) = ChannelProgress::new();
        drop(rx);
        sink.announce(ProgressUpdate::Milestone(1.0));
    }

    proptest! {
        #[test]
        fn test_announced_milestones_never_decrease(
            values in prop::collection::vec(-1.0f64..3.0, 0..50),
        ) {
            let mut tracker = MilestoneTracker::new();
            let announced: Vec<f64> = values.into_iter().filter_map(|v| tracker.advance(v)).collect();

            prop_assert!(announced.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(announced.iter().all(|v| (0.0..=2.0).contains(v)));
        }
    }
}
