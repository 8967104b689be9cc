// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 边缘流水线 (Edge pipeline)
///
/// 每个阶段一个线程, 通过有界交接通道通信:
/// - capture:   帧源 → 帧缓冲
/// - inference: 帧缓冲 → 限速推理 → 检测通道
/// - publish:   检测通道 → 传输层 (固定周期)
/// - commands:  指令主题 → 安全状态 (唯一写者)
/// - preview:   标注帧 → JPEG 预览 (display 模式)
///
/// 启动顺序: 配置校验 → 传输连接 → 模型加载 → 帧源 → 视频外发 → 各阶段线程.
/// 任一步启动失败, 已启动的部分按相反顺序清理.
pub mod capture;
pub mod handoff;
pub mod pacer;
pub mod preview;
pub mod shutdown;
pub mod stats;

pub use capture::CaptureStage;
pub use handoff::{Handoff, Offer};
pub use pacer::Pacer;
pub use preview::PreviewWriter;
pub use shutdown::Shutdown;
pub use stats::{PipelineStats, StatsSnapshot};

use crate::config::{EdgeConfig, PolicyConfig};
use crate::detection::worker::Annotated;
use crate::detection::{load_detector, DetectionFilter, DetectionWorker, Detector};
use crate::egress::{EgressState, EgressSupervisor};
use crate::error::PipelineError;
use crate::input::{open_source, FrameSource};
use crate::safety::{safety_state, CommandListener, SafetyHandle};
use crate::telemetry::TelemetryPublisher;
use crate::transport::{self, Topics, Transport};
use crate::types::{DetectionBatch, Frame};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const JOIN_POLL: Duration = Duration::from_millis(10);
const WATCH_POLL: Duration = Duration::from_millis(200);

/// Joins `handle` if it finishes before `deadline`; otherwise detaches it.
pub fn join_with_timeout(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        warn!("stage thread panicked");
    }
    true
}

// ========== 启动 ==========

/// Startup with optional injected collaborators; anything not injected is
/// built from the configuration.
pub struct PipelineBuilder {
    cfg: EdgeConfig,
    transport: Option<Arc<dyn Transport>>,
    detector: Option<Box<dyn Detector>>,
    source: Option<Box<dyn FrameSource>>,
    egress: Option<EgressSupervisor>,
}

impl PipelineBuilder {
    pub fn new(cfg: EdgeConfig) -> Self {
        Self {
            cfg,
            transport: None,
            detector: None,
            source: None,
            egress: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn source(mut self, source: Box<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Used instead of the default supervisor when `egress.enabled` is set.
    pub fn egress(mut self, egress: EgressSupervisor) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn start(self) -> Result<EdgePipeline, PipelineError> {
        let PipelineBuilder {
            cfg,
            transport,
            detector,
            source,
            egress,
        } = self;
        cfg.validate()?;
        let topics = Topics::new(cfg.topic_prefix.clone(), cfg.device_id.clone());
        let transport = match transport {
            Some(t) => t,
            None => transport::connect(&cfg.transport, &cfg.device_id)?,
        };
        let (writer, safety) = safety_state();
        let mut pipeline = EdgePipeline {
            shutdown: Shutdown::new(),
            safety,
            stats: Arc::new(PipelineStats::default()),
            transport: transport.clone(),
            egress: None,
            stages: Vec::new(),
            batches: Handoff::new(cfg.pipeline.detection_sharing, cfg.pipeline.detection_channel_capacity),
            timeout: cfg.shutdown_timeout(),
            stopped: false,
            cfg,
        };
        let cfg = pipeline.cfg.clone();
        let wants_frames = cfg.pipeline.yolo_enabled || cfg.pipeline.display;

        let detector = if cfg.pipeline.yolo_enabled {
            match detector.map_or_else(|| load_detector(&cfg.detector), Ok) {
                Ok(d) => Some(d),
                Err(e) => return Err(pipeline.abort(e)),
            }
        } else {
            None
        };

        let source = if wants_frames {
            match source.map_or_else(|| open_source(&cfg.source), Ok) {
                Ok(s) => Some(s),
                Err(e) => return Err(pipeline.abort(e)),
            }
        } else {
            None
        };

        if cfg.pipeline.display {
            let dir = match cfg.pipeline.preview_path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => std::path::PathBuf::from("."),
            };
            if std::fs::create_dir_all(&dir).is_err() {
                return Err(pipeline.abort(PipelineError::PreviewDir(dir)));
            }
        }

        if cfg.egress.enabled {
            let mut sup =
                egress.unwrap_or_else(|| EgressSupervisor::with_defaults(cfg.egress.clone(), cfg.source.clone()));
            if let Err(e) = sup.start() {
                return Err(pipeline.abort(e));
            }
            pipeline.egress = Some(sup);
        }

        // command listener first so no command published after startup is missed
        let mut listener = CommandListener::new(topics.commands(), writer);
        let commands = match listener.subscribe(transport.as_ref()) {
            Ok(rx) => rx,
            Err(e) => return Err(pipeline.abort(e)),
        };
        let s = pipeline.shutdown.clone();
        if let Err(e) = pipeline.spawn("commands", move || listener.run(commands, s)) {
            return Err(pipeline.abort(e));
        }

        let publisher = TelemetryPublisher::new(
            transport.clone(),
            topics.clone(),
            pipeline.batches.clone(),
            pipeline.stats.clone(),
        )
        .with_interval(cfg.publish_interval())
        .with_heartbeat(Duration::from_millis(cfg.telemetry.heartbeat_interval_ms));
        let s = pipeline.shutdown.clone();
        if let Err(e) = pipeline.spawn("publish", move || publisher.run(s)) {
            return Err(pipeline.abort(e));
        }

        let preview = cfg.pipeline.display.then(Handoff::<Annotated>::latest);
        if let Some(preview) = &preview {
            let writer = PreviewWriter::new(
                preview.clone(),
                cfg.pipeline.preview_path.clone(),
                PolicyConfig::default().critical_types,
            );
            let s = pipeline.shutdown.clone();
            if let Err(e) = pipeline.spawn("preview", move || writer.run(s)) {
                return Err(pipeline.abort(e));
            }
        }

        let frames = Handoff::<Frame>::new(cfg.pipeline.frame_sharing, cfg.pipeline.frame_buffer_capacity);
        if let Some(detector) = detector {
            let mut worker = DetectionWorker::new(
                detector,
                DetectionFilter::from_config(&cfg.detector),
                frames.clone(),
                pipeline.batches.clone(),
                pipeline.stats.clone(),
            )
            .with_interval(cfg.inference_interval())
            .with_error_backoff(Duration::from_millis(cfg.detector.error_backoff_ms));
            if let Some(preview) = &preview {
                worker = worker.with_preview(preview.clone());
            }
            let s = pipeline.shutdown.clone();
            if let Err(e) = pipeline.spawn("inference", move || worker.run(s)) {
                return Err(pipeline.abort(e));
            }
        }

        if let Some(source) = source {
            let mut stage = CaptureStage::new(source, pipeline.stats.clone())
                .with_retry_backoff(Duration::from_millis(cfg.source.retry_backoff_ms));
            stage = match (cfg.pipeline.yolo_enabled, preview) {
                (true, _) => stage.with_frames(frames),
                (false, Some(preview)) => stage.with_preview(preview),
                (false, None) => stage,
            };
            let s = pipeline.shutdown.clone();
            if let Err(e) = pipeline.spawn("capture", move || stage.run(s)) {
                return Err(pipeline.abort(e));
            }
        }

        info!(
            device = %cfg.device_id,
            yolo = cfg.pipeline.yolo_enabled,
            display = cfg.pipeline.display,
            egress = cfg.egress.enabled,
            stages = pipeline.stages.len(),
            "edge pipeline started"
        );
        Ok(pipeline)
    }
}

// ========== 运行时上下文 ==========

/// Owns every stage thread, the transport and the egress child.
pub struct EdgePipeline {
    cfg: EdgeConfig,
    shutdown: Shutdown,
    safety: SafetyHandle,
    stats: Arc<PipelineStats>,
    transport: Arc<dyn Transport>,
    egress: Option<EgressSupervisor>,
    stages: Vec<(&'static str, JoinHandle<()>)>,
    batches: Handoff<DetectionBatch>,
    timeout: Duration,
    stopped: bool,
}

impl EdgePipeline {
    pub fn builder(cfg: EdgeConfig) -> PipelineBuilder {
        PipelineBuilder::new(cfg)
    }

    /// Starts everything from configuration alone.
    pub fn start(cfg: EdgeConfig) -> Result<Self, PipelineError> {
        PipelineBuilder::new(cfg).start()
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.cfg
    }

    pub fn safety(&self) -> SafetyHandle {
        self.safety.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Clone of the stop signal; cancelling it ends every stage.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn egress_state(&self) -> Option<EgressState> {
        self.egress.as_ref().map(|e| e.state())
    }

    /// Detection channel depth.
    pub fn queue_size(&self) -> usize {
        self.batches.len()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(name, _)| *name).collect()
    }

    /// True once the capture stage has ended (source exhausted). Without a
    /// capture stage there is nothing to finish, so this stays false.
    pub fn capture_finished(&self) -> bool {
        self.stages
            .iter()
            .find(|(name, _)| *name == "capture")
            .is_some_and(|(_, h)| h.is_finished())
    }

    /// Blocks until shutdown is signalled, capture ends, or `limit` elapses.
    /// Without a capture stage only the first and last apply.
    /// Also watches the egress child and logs when it dies.
    pub fn wait(&mut self, limit: Option<Duration>) {
        let deadline = limit.map(|l| Instant::now() + l);
        let mut egress_alive = true;
        loop {
            if self.capture_finished() {
                info!("capture finished");
                break;
            }
            let slice = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    left.min(WATCH_POLL)
                }
                None => WATCH_POLL,
            };
            if let Some(egress) = self.egress.as_mut() {
                if egress_alive && egress.check() == EgressState::Failed {
                    egress_alive = false;
                    warn!("video egress stopped; detection continues without it");
                }
            }
            if self.shutdown.wait_timeout(slice) {
                break;
            }
        }
    }

    fn spawn(&mut self, stage: &'static str, f: impl FnOnce() + Send + 'static) -> Result<(), PipelineError> {
        let handle = std::thread::Builder::new()
            .name(format!("edgeguard-{stage}"))
            .spawn(f)
            .map_err(|e| PipelineError::spawn(stage, e))?;
        debug!(stage, "stage spawned");
        self.stages.push((stage, handle));
        Ok(())
    }

    fn abort(mut self, e: impl Into<PipelineError>) -> PipelineError {
        let e = e.into();
        warn!("startup failed: {e}; stopping started stages");
        self.stop();
        e
    }

    /// Cancel, terminate egress, disconnect, then join every stage with a bounded wait.
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.cancel();
        if let Some(mut egress) = self.egress.take() {
            egress.shutdown();
        }
        self.transport.disconnect();

        let deadline = Instant::now() + self.timeout;
        for (stage, handle) in self.stages.drain(..) {
            if join_with_timeout(handle, deadline) {
                debug!(stage, "stage joined");
            } else {
                warn!(stage, "stage did not stop in time; detached");
            }
        }
        info!(stats = ?self.stats.snapshot(), "edge pipeline stopped");
    }

    pub fn shutdown(mut self) -> StatsSnapshot {
        self.stop();
        self.stats.snapshot()
    }
}

impl Drop for EdgePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceKind, TransportKind};
    use crate::detection::{DetectorError, RawDetection};
    use crate::transport::LocalBus;
    use image::RgbImage;

    struct AlwaysPerson;

    impl Detector for AlwaysPerson {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
            Ok(vec![RawDetection::new([1., 1., 6., 6.], 0, 0.9)])
        }

        fn name(&self) -> &str {
            "always-person"
        }
    }

    fn local_cfg() -> EdgeConfig {
        let mut cfg = EdgeConfig::default();
        cfg.transport.kind = TransportKind::Local;
        cfg.source.kind = SourceKind::Synthetic;
        cfg.source.width = 32;
        cfg.source.height = 24;
        cfg.detector.interval_ms = 20;
        cfg.telemetry.publish_interval_ms = 50;
        cfg.pipeline.shutdown_timeout_ms = 1000;
        cfg
    }

    #[test]
    fn failed_source_aborts_startup_and_disconnects() {
        let bus = LocalBus::new();
        let mut cfg = local_cfg();
        cfg.source.kind = SourceKind::File;
        cfg.source.path = "/nonexistent/edgeguard/input.png".into();
        let err = EdgePipeline::builder(cfg)
            .transport(Arc::new(bus.clone()))
            .detector(Box::new(AlwaysPerson))
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Source(_)));
        assert!(bus.subscribe("x").is_err(), "transport left connected");
    }

    #[test]
    fn stages_follow_configuration() {
        let mut cfg = local_cfg();
        cfg.pipeline.yolo_enabled = false;
        let pipeline = EdgePipeline::builder(cfg)
            .transport(Arc::new(LocalBus::new()))
            .start()
            .unwrap();
        assert_eq!(pipeline.stage_names(), vec!["commands", "publish"]);
        assert!(!pipeline.capture_finished());
        pipeline.shutdown();
    }

    #[test]
    fn wait_without_capture_runs_until_limit() {
        let bus = LocalBus::new();
        let mut cfg = local_cfg();
        cfg.pipeline.yolo_enabled = false;
        let mut pipeline = EdgePipeline::builder(cfg)
            .transport(Arc::new(bus.clone()))
            .start()
            .unwrap();
        let safety = pipeline.safety();

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let cmd = crate::types::Command::new(crate::types::CommandKind::Stop, "obstacle", "operator");
            bus.publish("adrve/commands/adrve_edge", cmd.to_json().unwrap()).unwrap();
        });

        let start = Instant::now();
        pipeline.wait(Some(Duration::from_millis(300)));
        let elapsed = start.elapsed();
        sender.join().unwrap();

        assert!(elapsed >= Duration::from_millis(300), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2));
        assert!(safety.is_stopped());
        pipeline.shutdown();
    }

    #[test]
    fn wait_returns_when_cancelled() {
        let mut cfg = local_cfg();
        cfg.pipeline.yolo_enabled = false;
        let mut pipeline = EdgePipeline::builder(cfg)
            .transport(Arc::new(LocalBus::new()))
            .start()
            .unwrap();
        let signal = pipeline.shutdown_signal();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            signal.cancel();
        });

        let start = Instant::now();
        pipeline.wait(None);
        canceller.join().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
        pipeline.shutdown();
    }

    #[test]
    fn shutdown_is_bounded() {
        let pipeline = EdgePipeline::builder(local_cfg())
            .transport(Arc::new(LocalBus::new()))
            .detector(Box::new(AlwaysPerson))
            .start()
            .unwrap();
        assert_eq!(pipeline.stage_names(), vec!["commands", "publish", "inference", "capture"]);
        std::thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        let stats = pipeline.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(stats.frames_captured > 0);
    }
}
