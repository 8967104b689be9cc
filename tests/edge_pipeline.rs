// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use edgeguard::config::{SourceKind, TransportKind};
use edgeguard::detection::{Detector, DetectorError, RawDetection};
use edgeguard::transport::{LocalBus, Transport};
use edgeguard::{Command, CommandKind, DetectionBatch, EdgeConfig, EdgePipeline, Mode, Provenance};
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct AlwaysPerson;

impl Detector for AlwaysPerson {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        Ok(vec![
            RawDetection::new([2., 2., 12., 12.], 0, 0.9),
            // below the default confidence threshold
            RawDetection::new([20., 2., 28., 12.], 2, 0.1),
        ])
    }
}

fn local_cfg() -> EdgeConfig {
    let mut cfg = EdgeConfig::default();
    cfg.transport.kind = TransportKind::Local;
    cfg.source.kind = SourceKind::Synthetic;
    cfg.source.width = 32;
    cfg.source.height = 24;
    cfg.source.fps = 50;
    cfg.detector.interval_ms = 20;
    cfg.telemetry.publish_interval_ms = 50;
    cfg.pipeline.shutdown_timeout_ms = 1000;
    cfg
}

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn send(bus: &LocalBus, kind: CommandKind, timestamp: f64) {
    let cmd = Command::new(kind, "test", "operator").with_timestamp(timestamp);
    bus.publish("adrve/commands/adrve_edge", cmd.to_json().unwrap()).unwrap();
}

#[test]
fn detections_reach_the_detection_topic() {
    let bus = LocalBus::new();
    let detections = bus.subscribe("adrve/status/adrve_edge/detection").unwrap();
    let pipeline = EdgePipeline::builder(local_cfg())
        .transport(Arc::new(bus.clone()))
        .detector(Box::new(AlwaysPerson))
        .start()
        .unwrap();

    let msg = detections.recv_timeout(Duration::from_secs(5)).unwrap();
    let batch: DetectionBatch = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(batch.source, Provenance::Edge);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.detections[0].label, "person");
    assert_eq!(batch.detections[0].class_id, 0);
    assert!(batch.timestamp > 0.0);

    let stats = pipeline.shutdown();
    assert!(stats.published >= 1);
    assert!(stats.frames_inferred >= 1);
}

#[test]
fn commands_apply_in_timestamp_order() {
    let bus = LocalBus::new();
    let mut cfg = local_cfg();
    cfg.pipeline.yolo_enabled = false;
    let pipeline = EdgePipeline::builder(cfg)
        .transport(Arc::new(bus.clone()))
        .start()
        .unwrap();
    let safety = pipeline.safety();
    assert_eq!(safety.mode(), Mode::Running);

    send(&bus, CommandKind::Stop, 100.0);
    assert!(wait_until(Duration::from_secs(3), || safety.is_stopped()));

    // older resume is ignored
    send(&bus, CommandKind::Resume, 50.0);
    assert!(wait_until(Duration::from_secs(3), || safety.stale_count() == 1));
    assert!(safety.is_stopped());

    bus.publish("adrve/commands/adrve_edge", b"{\"command\":".to_vec()).unwrap();
    assert!(wait_until(Duration::from_secs(3), || safety.malformed_count() == 1));
    assert!(safety.is_stopped());

    send(&bus, CommandKind::Resume, 150.0);
    assert!(wait_until(Duration::from_secs(3), || !safety.is_stopped()));
    assert_eq!(safety.snapshot().last_applied, Some(150.0));
    assert_eq!(safety.applied_count(), 2);

    pipeline.shutdown();
}

#[test]
fn display_mode_writes_preview() {
    let dir = tempfile::tempdir().unwrap();
    let preview = dir.path().join("out/preview.jpg");
    let mut cfg = local_cfg();
    cfg.pipeline.display = true;
    cfg.pipeline.preview_path = preview.clone();
    let pipeline = EdgePipeline::builder(cfg)
        .transport(Arc::new(LocalBus::new()))
        .detector(Box::new(AlwaysPerson))
        .start()
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || preview.exists()));
    pipeline.shutdown();
    let img = image::open(&preview).unwrap();
    assert_eq!((img.width(), img.height()), (32, 24));
}
