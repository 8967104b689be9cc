// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Cloud stop decisions reaching the edge safety state over one bus.

use edgeguard::cloud::operator::{send_command, OperatorRequest};
use edgeguard::cloud::{FusionError, FusionService, VisionModel};
use edgeguard::config::{SourceKind, TransportKind};
use edgeguard::transport::{LocalBus, Transport};
use edgeguard::{EdgeConfig, EdgePipeline, FusionConfig};
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fixed(&'static str);

impl VisionModel for Fixed {
    fn analyze(&self, _jpeg: &[u8]) -> Result<String, FusionError> {
        Ok(self.0.to_string())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

fn edge(bus: &LocalBus) -> EdgePipeline {
    let mut cfg = EdgeConfig::default();
    cfg.transport.kind = TransportKind::Local;
    cfg.source.kind = SourceKind::Synthetic;
    cfg.pipeline.yolo_enabled = false;
    cfg.pipeline.shutdown_timeout_ms = 1000;
    EdgePipeline::builder(cfg)
        .transport(Arc::new(bus.clone()))
        .start()
        .unwrap()
}

fn fusion(root: &std::path::Path, reply: &'static str, bus: &LocalBus) -> FusionService {
    let mut cfg = FusionConfig::default();
    cfg.storage.root = root.join("objects");
    cfg.storage.record_file = root.join("records.jsonl");
    FusionService::new(cfg, Box::new(Fixed(reply)), Arc::new(bus.clone()))
}

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn cloud_stop_then_operator_resume() {
    let dir = tempfile::tempdir().unwrap();
    let bus = LocalBus::new();
    let pipeline = edge(&bus);
    let safety = pipeline.safety();

    let svc = fusion(
        dir.path(),
        r#"Here you go: {"objects":[{"type":"Dog","confidence":0.88,"box":[0,0,4,4]}]}"#,
        &bus,
    );
    let outcome = svc.process_frame(&RgbImage::new(16, 16), edgeguard::unix_now()).unwrap();
    let stop = outcome.command.unwrap();
    assert_eq!(stop.reason, "Critical objects detected: dog");
    assert!(eventually(|| safety.is_stopped()));
    assert_eq!(safety.snapshot().last_command.unwrap().issuer, "fusion");

    std::thread::sleep(Duration::from_millis(5));
    let resp = send_command(
        &bus,
        "adrve",
        &OperatorRequest {
            command: "resume".into(),
            reason: "area clear".into(),
            device_id: "adrve_edge".into(),
        },
    );
    assert!(resp.success);
    assert!(resp.timestamp > stop.timestamp);
    assert!(eventually(|| !safety.is_stopped()));

    pipeline.shutdown();
}

#[test]
fn harmless_scene_leaves_vehicle_running() {
    let dir = tempfile::tempdir().unwrap();
    let bus = LocalBus::new();
    let pipeline = edge(&bus);
    let commands = bus.subscribe("adrve/commands/+").unwrap();

    let svc = fusion(dir.path(), r#"{"objects":[{"type":"car","confidence":0.99}]}"#, &bus);
    let outcome = svc.process_frame(&RgbImage::new(16, 16), 1.0).unwrap();
    assert!(outcome.command.is_none());
    assert!(commands.try_recv().is_err());

    std::thread::sleep(Duration::from_millis(100));
    assert!(!pipeline.safety().is_stopped());
    assert_eq!(svc.records().read_all().unwrap().len(), 1);
    pipeline.shutdown();
}
