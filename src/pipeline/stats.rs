// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Drop / error counters shared by the edge stages.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_replaced: AtomicU64,
    pub source_errors: AtomicU64,
    pub frames_inferred: AtomicU64,
    pub inference_errors: AtomicU64,
    pub malformed_boxes: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub batches_replaced: AtomicU64,
    pub published: AtomicU64,
    pub publish_errors: AtomicU64,
}

/// Point-in-time copy for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_replaced: u64,
    pub source_errors: u64,
    pub frames_inferred: u64,
    pub inference_errors: u64,
    pub malformed_boxes: u64,
    pub batches_dropped: u64,
    pub batches_replaced: u64,
    pub published: u64,
    pub publish_errors: u64,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: get(&self.frames_captured),
            frames_dropped: get(&self.frames_dropped),
            frames_replaced: get(&self.frames_replaced),
            source_errors: get(&self.source_errors),
            frames_inferred: get(&self.frames_inferred),
            inference_errors: get(&self.inference_errors),
            malformed_boxes: get(&self.malformed_boxes),
            batches_dropped: get(&self.batches_dropped),
            batches_replaced: get(&self.batches_replaced),
            published: get(&self.published),
            publish_errors: get(&self.publish_errors),
        }
    }
}
