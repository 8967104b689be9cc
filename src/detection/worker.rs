// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测线程 (detection worker)
/// 帧缓冲 → 限速推理 → 过滤 → 检测通道
use super::{DetectionFilter, Detector, DetectorError, RawDetection};
use crate::pipeline::{Handoff, Offer, Pacer, PipelineStats, Shutdown};
use crate::types::{DetectionBatch, Frame, Provenance};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Frame plus the batch computed from it, for the display path.
#[derive(Debug, Clone)]
pub struct Annotated {
    pub frame: Frame,
    pub batch: DetectionBatch,
}

pub struct DetectionWorker {
    detector: Box<dyn Detector>,
    filter: DetectionFilter,
    interval: Duration,
    error_backoff: Duration,
    frames: Handoff<Frame>,
    batches: Handoff<DetectionBatch>,
    preview: Option<Handoff<Annotated>>,
    stats: Arc<PipelineStats>,
}

impl DetectionWorker {
    pub fn new(
        detector: Box<dyn Detector>,
        filter: DetectionFilter,
        frames: Handoff<Frame>,
        batches: Handoff<DetectionBatch>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            detector,
            filter,
            interval: Duration::from_millis(200),
            error_backoff: Duration::from_secs(1),
            frames,
            batches,
            preview: None,
            stats,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Also hand a copy of each processed frame to the display path.
    pub fn with_preview(mut self, preview: Handoff<Annotated>) -> Self {
        self.preview = Some(preview);
        self
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, DetectorError> {
        let detector = &mut self.detector;
        match catch_unwind(AssertUnwindSafe(|| detector.detect(&frame.image))) {
            Ok(result) => result,
            Err(_) => Err(DetectorError::Inference("detector panicked".to_string())),
        }
    }

    pub fn run(mut self, shutdown: Shutdown) {
        info!(
            detector = self.detector.name(),
            interval_ms = self.interval.as_millis() as u64,
            "detection worker started"
        );
        let mut pacer = Pacer::new(self.interval);

        loop {
            if !pacer.wait(&shutdown) {
                break;
            }
            let Some(frame) = self.frames.take(&shutdown) else {
                break;
            };
            pacer.mark();

            let raw = match self.infer(&frame) {
                Ok(raw) => raw,
                Err(e) => {
                    PipelineStats::incr(&self.stats.inference_errors);
                    warn!(seq = frame.seq, "inference error: {e}; backing off");
                    if shutdown.wait_timeout(self.error_backoff) {
                        break;
                    }
                    continue;
                }
            };
            PipelineStats::incr(&self.stats.frames_inferred);

            let (detections, malformed) = self.filter.apply(raw);
            if malformed > 0 {
                PipelineStats::add(&self.stats.malformed_boxes, malformed);
                debug!(seq = frame.seq, malformed, "discarded malformed boxes");
            }
            let batch = DetectionBatch::new(frame.timestamp, detections, Provenance::Edge);
            debug!(seq = frame.seq, count = batch.len(), "detections");

            if let Some(preview) = &self.preview {
                preview.offer(Annotated {
                    frame,
                    batch: batch.clone(),
                });
            }

            match self.batches.offer(batch) {
                Offer::Accepted => {}
                Offer::Dropped => PipelineStats::incr(&self.stats.batches_dropped),
                Offer::Replaced => PipelineStats::incr(&self.stats.batches_replaced),
            }
        }
        info!("detection worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::Mutex;
    use std::time::Instant;

    struct Scripted {
        calls: Arc<Mutex<Vec<Instant>>>,
        fail_first: usize,
    }

    impl Detector for Scripted {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            if calls.len() <= self.fail_first {
                return Err(DetectorError::Inference("boom".into()));
            }
            Ok(vec![
                RawDetection::new([1., 1., 4., 4.], 0, 0.8),
                RawDetection::new([1., 1., 4., 4.], 42, 0.8),
            ])
        }
    }

    fn feed(frames: &Handoff<Frame>, n: u64) {
        for seq in 0..n {
            frames.offer(Frame::new(seq, RgbImage::new(8, 8)));
        }
    }

    #[test]
    fn emits_filtered_batches_spaced_by_interval() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let frames = Handoff::queue(10);
        let batches = Handoff::queue(10);
        let stats = Arc::new(PipelineStats::default());
        let worker = DetectionWorker::new(
            Box::new(Scripted {
                calls: calls.clone(),
                fail_first: 0,
            }),
            DetectionFilter::new([0], 0.3),
            frames.clone(),
            batches.clone(),
            stats.clone(),
        )
        .with_interval(Duration::from_millis(40));

        feed(&frames, 5);
        let shutdown = Shutdown::new();
        let s = shutdown.clone();
        let t = std::thread::spawn(move || worker.run(s));
        std::thread::sleep(Duration::from_millis(250));
        shutdown.cancel();
        t.join().unwrap();

        let calls = calls.lock().unwrap();
        assert!(calls.len() >= 3, "only {} inferences", calls.len());
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(35));
        }
        let out = batches.drain();
        assert_eq!(out.len(), calls.len());
        assert!(out.iter().all(|b| b.len() == 1 && b.detections[0].class_id == 0));
    }

    #[test]
    fn survives_inference_errors() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let frames = Handoff::queue(10);
        let batches = Handoff::queue(10);
        let stats = Arc::new(PipelineStats::default());
        let worker = DetectionWorker::new(
            Box::new(Scripted {
                calls: calls.clone(),
                fail_first: 2,
            }),
            DetectionFilter::new([0], 0.3),
            frames.clone(),
            batches.clone(),
            stats.clone(),
        )
        .with_interval(Duration::from_millis(1))
        .with_error_backoff(Duration::from_millis(20));

        feed(&frames, 4);
        let shutdown = Shutdown::new();
        let s = shutdown.clone();
        let t = std::thread::spawn(move || worker.run(s));
        let deadline = Instant::now() + Duration::from_secs(2);
        while batches.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown.cancel();
        t.join().unwrap();

        assert_eq!(stats.snapshot().inference_errors, 2);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn exits_promptly_when_idle() {
        let frames: Handoff<Frame> = Handoff::queue(1);
        let worker = DetectionWorker::new(
            Box::new(Scripted {
                calls: Arc::default(),
                fail_first: 0,
            }),
            DetectionFilter::new([0], 0.3),
            frames,
            Handoff::queue(1),
            Arc::default(),
        );
        let shutdown = Shutdown::new();
        let s = shutdown.clone();
        let t = std::thread::spawn(move || worker.run(s));
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        shutdown.cancel();
        t.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
