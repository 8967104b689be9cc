// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 采集线程 (capture stage): source → frame buffer, or straight to preview without inference.

use super::{Handoff, Offer, PipelineStats, Shutdown};
use crate::detection::worker::Annotated;
use crate::input::{FrameSource, SourceError};
use crate::types::{DetectionBatch, Frame, Provenance};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct CaptureStage {
    source: Box<dyn FrameSource>,
    frames: Option<Handoff<Frame>>,
    preview: Option<Handoff<Annotated>>,
    stats: Arc<PipelineStats>,
    retry_backoff: Duration,
}

impl CaptureStage {
    pub fn new(source: Box<dyn FrameSource>, stats: Arc<PipelineStats>) -> Self {
        Self {
            source,
            frames: None,
            preview: None,
            stats,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Feed the detection worker.
    pub fn with_frames(mut self, frames: Handoff<Frame>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Feed the display path directly; only used when nothing consumes `frames`.
    pub fn with_preview(mut self, preview: Handoff<Annotated>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn run(mut self, shutdown: Shutdown) {
        info!(source = %self.source.describe(), "capture started");
        let mut seq: u64 = 0;

        while !shutdown.is_cancelled() {
            let image = match self.source.read() {
                Ok(image) => image,
                Err(SourceError::Exhausted) => {
                    info!("source exhausted");
                    break;
                }
                Err(e) => {
                    PipelineStats::incr(&self.stats.source_errors);
                    warn!("{e}; retrying");
                    if shutdown.wait_timeout(self.retry_backoff) {
                        break;
                    }
                    continue;
                }
            };
            let frame = Frame::new(seq, image);
            seq += 1;
            PipelineStats::incr(&self.stats.frames_captured);

            match (&self.frames, &self.preview) {
                (Some(frames), _) => match frames.offer(frame) {
                    Offer::Accepted => {}
                    Offer::Dropped => {
                        PipelineStats::incr(&self.stats.frames_dropped);
                        debug!(seq, "frame buffer full, frame dropped");
                    }
                    Offer::Replaced => PipelineStats::incr(&self.stats.frames_replaced),
                },
                (None, Some(preview)) => {
                    let batch = DetectionBatch::new(frame.timestamp, Vec::new(), Provenance::Edge);
                    preview.offer(Annotated { frame, batch });
                }
                (None, None) => {}
            }
        }
        info!(frames = seq, "capture stopped");
    }
}
