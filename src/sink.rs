//! Outbound interface towards persistence and monitoring.

use parking_lot::Mutex;

use crate::aggregate::AggregateSnapshot;
use crate::worker::FrameOutcome;

/// Receives results from the pipeline.
///
/// Called from worker threads concurrently and in no particular frame
/// order; implementations synchronize internally.
pub trait FrameSink: Send + Sync {
    /// One frame finished processing.
    fn frame_processed(&self, outcome: &FrameOutcome);

    /// Periodic and final flush of every running sum.
    fn running_sums(&self, _snapshots: &[AggregateSnapshot]) {}
}

/// Sink that keeps everything in memory. Mostly useful in tests.
#[derive(Default)]
pub struct MemorySink {
    outcomes: Mutex<Vec<FrameOutcome>>,
    flushes: Mutex<Vec<Vec<AggregateSnapshot>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes received so far, sorted by sequence id.
    pub fn outcomes(&self) -> Vec<FrameOutcome> {
        let mut outcomes = self.outcomes.lock().clone();
        outcomes.sort_by_key(|o| o.metadata.sequence_id);
        outcomes
    }

    pub fn frame_count(&self) -> usize {
        self.outcomes.lock().len()
    }

    /// Every flush received, oldest first.
    pub fn flushes(&self) -> Vec<Vec<AggregateSnapshot>> {
        self.flushes.lock().clone()
    }
}

impl FrameSink for MemorySink {
    fn frame_processed(&self, outcome: &FrameOutcome) {
        self.outcomes.lock().push(outcome.clone());
    }

    fn running_sums(&self, snapshots: &[AggregateSnapshot]) {
        self.flushes.lock().push(snapshots.to_vec());
    }
}
