// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测结果上报 (Telemetry publisher)
///
/// - 按固定周期排空检测通道, 逐批发布到 `P/status/D/detection`
/// - 通道为空则不发布 (不合成空批次)
/// - 可选心跳 `P/status/D/heartbeat`
use crate::pipeline::{Handoff, Pacer, PipelineStats, Shutdown};
use crate::transport::{Topics, Transport};
use crate::types::DetectionBatch;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heartbeat {
    pub timestamp: f64,
    pub status: &'static str,
    pub queue_size: usize,
}

pub struct TelemetryPublisher {
    transport: Arc<dyn Transport>,
    topics: Topics,
    batches: Handoff<DetectionBatch>,
    stats: Arc<PipelineStats>,
    interval: Duration,
    heartbeat: Option<Duration>,
    last_heartbeat: Option<Instant>,
}

impl TelemetryPublisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        topics: Topics,
        batches: Handoff<DetectionBatch>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            transport,
            topics,
            batches,
            stats,
            interval: Duration::from_secs(1),
            heartbeat: None,
            last_heartbeat: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// `Duration::ZERO` disables the heartbeat.
    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = (!every.is_zero()).then_some(every);
        self
    }

    /// Publishes every queued batch, oldest first. Returns how many went out.
    pub fn tick(&mut self) -> usize {
        let pending = self.batches.drain();
        if pending.is_empty() {
            return 0;
        }
        let topic = self.topics.detection();
        let mut sent = 0;
        for batch in pending {
            let payload = match batch.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    PipelineStats::incr(&self.stats.publish_errors);
                    warn!("batch serialization failed: {e}");
                    continue;
                }
            };
            match self.transport.publish(&topic, payload) {
                Ok(()) => {
                    sent += 1;
                    PipelineStats::incr(&self.stats.published);
                    debug!(%topic, detections = batch.len(), timestamp = batch.timestamp, "batch published");
                }
                Err(e) => {
                    PipelineStats::incr(&self.stats.publish_errors);
                    warn!("publish failed: {e}");
                }
            }
        }
        sent
    }

    /// Sends a heartbeat if one is due.
    pub fn heartbeat_tick(&mut self) -> bool {
        let Some(every) = self.heartbeat else {
            return false;
        };
        if self.last_heartbeat.is_some_and(|t| t.elapsed() < every) {
            return false;
        }
        self.last_heartbeat = Some(Instant::now());
        let beat = Heartbeat {
            timestamp: crate::unix_now(),
            status: "alive",
            queue_size: self.batches.len(),
        };
        let payload = match serde_json::to_vec(&beat) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("heartbeat serialization failed: {e}");
                return false;
            }
        };
        match self.transport.publish(&self.topics.heartbeat(), payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("heartbeat failed: {e}");
                false
            }
        }
    }

    pub fn run(mut self, shutdown: Shutdown) {
        info!(
            topic = %self.topics.detection(),
            interval_ms = self.interval.as_millis() as u64,
            "telemetry publisher started"
        );
        let mut pacer = Pacer::new(self.interval);
        // first tick one interval after start
        pacer.mark();
        while pacer.wait(&shutdown) {
            pacer.mark();
            self.tick();
            self.heartbeat_tick();
        }
        info!("telemetry publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalBus, Message, TransportError};
    use crate::types::{Detection, Provenance};
    use crossbeam_channel::Receiver;

    struct Failing;

    impl Transport for Failing {
        fn publish(&self, topic: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
            Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "offline".into(),
            })
        }

        fn subscribe(&self, _filter: &str) -> Result<Receiver<Message>, TransportError> {
            Err(TransportError::Disconnected)
        }

        fn disconnect(&self) {}
    }

    fn batch(ts: f64) -> DetectionBatch {
        let d = Detection {
            bbox: [0., 0., 5., 5.],
            label: "person".into(),
            class_id: 0,
            confidence: 0.5,
            provenance: Provenance::Edge,
        };
        DetectionBatch::new(ts, vec![d], Provenance::Edge)
    }

    #[test]
    fn empty_channel_publishes_nothing() {
        let bus = LocalBus::new();
        let mut publisher = TelemetryPublisher::new(
            Arc::new(bus.clone()),
            Topics::new("p", "d"),
            Handoff::queue(4),
            Arc::default(),
        );
        assert_eq!(publisher.tick(), 0);
        assert_eq!(bus.published(), 0);
    }

    #[test]
    fn drains_batches_in_order() {
        let bus = LocalBus::new();
        let rx = bus.subscribe("p/status/d/detection").unwrap();
        let batches = Handoff::queue(4);
        batches.offer(batch(1.0));
        batches.offer(batch(2.0));
        let mut publisher =
            TelemetryPublisher::new(Arc::new(bus.clone()), Topics::new("p", "d"), batches.clone(), Arc::default());

        assert_eq!(publisher.tick(), 2);
        assert!(batches.is_empty());
        let got: Vec<f64> = rx
            .try_iter()
            .map(|m| serde_json::from_slice::<DetectionBatch>(&m.payload).unwrap().timestamp)
            .collect();
        assert_eq!(got, vec![1.0, 2.0]);
    }

    #[test]
    fn publish_errors_are_counted_not_fatal() {
        let stats = Arc::new(PipelineStats::default());
        let batches = Handoff::queue(4);
        batches.offer(batch(1.0));
        let mut publisher = TelemetryPublisher::new(Arc::new(Failing), Topics::new("p", "d"), batches, stats.clone());
        assert_eq!(publisher.tick(), 0);
        assert_eq!(stats.snapshot().publish_errors, 1);
    }

    #[test]
    fn heartbeat_reports_queue_depth() {
        let bus = LocalBus::new();
        let rx = bus.subscribe("p/status/d/heartbeat").unwrap();
        let batches = Handoff::queue(4);
        batches.offer(batch(1.0));
        let mut publisher = TelemetryPublisher::new(Arc::new(bus), Topics::new("p", "d"), batches, Arc::default())
            .with_heartbeat(Duration::from_secs(60));

        assert!(publisher.heartbeat_tick());
        assert!(!publisher.heartbeat_tick());
        let beat: serde_json::Value = serde_json::from_slice(&rx.try_recv().unwrap().payload).unwrap();
        assert_eq!(beat["status"], "alive");
        assert_eq!(beat["queue_size"], 1);
    }
}
