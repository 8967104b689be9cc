// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 云端融合服务 (Cloud fusion service)
///
/// 帧 → JPEG → 视觉模型 → 停车策略 → 指令发布 + 帧/记录存储
/// - 连续模式: 按间隔处理输入目录中最新的一帧
/// - 单帧模式: 处理一个图像文件
/// - 通知模式: 目录监视线程推送 FrameNotification
pub mod operator;
pub mod policy;
pub mod store;
pub mod vision;

pub use policy::StopPolicy;
pub use store::{frame_key, DetectionReport, FrameRecord, ObjectStore, RecordStore};
pub use vision::{parse_objects, HttpVisionModel, VisionModel, VisionObject};

use crate::config::{ConfigError, FusionConfig};
use crate::overlay;
use crate::pipeline::{Pacer, Shutdown};
use crate::transport::{Topics, Transport, TransportError};
use crate::types::Command;
use crossbeam_channel::{bounded, select, Receiver};
use image::RgbImage;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("vision model error: {0}")]
    Vision(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl FusionError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        FusionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A new frame landed in the watched directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameNotification {
    pub path: PathBuf,
    pub received_at: f64,
}

/// Result of one processed frame.
#[derive(Debug, Clone)]
pub struct FusionOutcome {
    pub frame_id: String,
    pub key: String,
    pub report: DetectionReport,
    /// Set when the policy issued a stop.
    pub command: Option<Command>,
    pub annotated: Option<PathBuf>,
}

pub struct FusionService {
    cfg: FusionConfig,
    vision: Box<dyn VisionModel>,
    transport: Arc<dyn Transport>,
    policy: StopPolicy,
    objects: ObjectStore,
    records: RecordStore,
    topics: Topics,
}

impl FusionService {
    pub fn new(cfg: FusionConfig, vision: Box<dyn VisionModel>, transport: Arc<dyn Transport>) -> Self {
        info!(
            model = vision.name(),
            root = %cfg.storage.root.display(),
            critical = ?cfg.policy.critical_types,
            "fusion service ready"
        );
        Self {
            policy: StopPolicy::from_config(&cfg.policy),
            objects: ObjectStore::new(&cfg.storage.root),
            records: RecordStore::new(&cfg.storage.record_file),
            topics: Topics::new(&cfg.topic_prefix, &cfg.device_id),
            cfg,
            vision,
            transport,
        }
    }

    pub fn policy(&self) -> &StopPolicy {
        &self.policy
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Encodes, analyzes, applies the stop policy and persists one frame.
    /// Only encoding failures are returned; model, storage and publish errors are logged.
    pub fn process_frame(&self, image: &RgbImage, timestamp: f64) -> Result<FusionOutcome, FusionError> {
        let jpeg = overlay::encode_jpeg(image, self.cfg.vision.jpeg_quality)?;
        let frame_id = uuid::Uuid::new_v4().to_string();

        let report = match self.vision.analyze(&jpeg) {
            Ok(text) => DetectionReport::cloud(parse_objects(&text), timestamp, None),
            Err(e) => {
                warn!(%frame_id, "vision model failed: {e}");
                DetectionReport::cloud(Vec::new(), timestamp, Some(e.to_string()))
            }
        };
        debug!(%frame_id, objects = report.objects.len(), "frame analyzed");

        let command = self.policy.evaluate(&report.objects);
        if let Some(cmd) = &command {
            self.publish(cmd);
        }

        let key = frame_key(timestamp, &frame_id);
        if let Err(e) = self.objects.put(&key, &jpeg) {
            error!(%key, "failed to store frame: {e}");
        }
        let record = FrameRecord::new(frame_id.clone(), timestamp, key.clone(), report.clone(), self.cfg.storage.ttl_days);
        if let Err(e) = self.records.put(&record) {
            error!(%frame_id, "failed to store record: {e}");
        }

        let annotated = if self.cfg.storage.annotate {
            self.annotate(image, &report, &frame_id)
        } else {
            None
        };

        Ok(FusionOutcome {
            frame_id,
            key,
            report,
            command,
            annotated,
        })
    }

    pub fn process_file(&self, path: &Path) -> Result<FusionOutcome, FusionError> {
        let image = image::open(path)?.to_rgb8();
        info!(path = %path.display(), "processing frame file");
        self.process_frame(&image, crate::unix_now())
    }

    /// Every `frames.interval_secs`, processes the newest unseen image in `frames.dir`.
    pub fn run_continuous(&self, shutdown: &Shutdown) -> u64 {
        let mut pacer = Pacer::new(Duration::from_secs(self.cfg.frames.interval_secs));
        let mut last: Option<(PathBuf, SystemTime)> = None;
        let mut processed = 0;
        info!(dir = %self.cfg.frames.dir.display(), "continuous fusion started");

        while !shutdown.is_cancelled() {
            pacer.mark();
            match newest_image(&self.cfg.frames.dir) {
                Some(found) if last.as_ref() != Some(&found) => {
                    match self.process_file(&found.0) {
                        Ok(_) => processed += 1,
                        Err(e) => warn!(path = %found.0.display(), "frame skipped: {e}"),
                    }
                    last = Some(found);
                }
                Some(_) => debug!("no new frame"),
                None => debug!("frame directory empty"),
            }
            if !pacer.wait(shutdown) {
                break;
            }
        }
        info!(processed, "continuous fusion stopped");
        processed
    }

    /// Processes notifications until the channel closes or shutdown fires.
    pub fn run_notifications(&self, rx: Receiver<FrameNotification>, shutdown: &Shutdown) -> u64 {
        let mut processed = 0;
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(note) => match self.process_file(&note.path) {
                        Ok(_) => processed += 1,
                        Err(e) => warn!(path = %note.path.display(), "frame skipped: {e}"),
                    },
                    Err(_) => break,
                },
                recv(shutdown.receiver()) -> _ => break,
            }
            if shutdown.is_cancelled() {
                break;
            }
        }
        info!(processed, "notification fusion stopped");
        processed
    }

    fn publish(&self, cmd: &Command) {
        let topic = self.topics.commands();
        let payload = match cmd.to_json() {
            Ok(p) => p,
            Err(e) => {
                error!("failed to encode command: {e}");
                return;
            }
        };
        match self.transport.publish(&topic, payload) {
            Ok(()) => info!(%topic, reason = %cmd.reason, "stop command sent"),
            Err(e) => error!(%topic, "failed to send stop command: {e}"),
        }
    }

    fn annotate(&self, image: &RgbImage, report: &DetectionReport, frame_id: &str) -> Option<PathBuf> {
        let mut canvas = image.clone();
        for obj in &report.objects {
            let Some(b) = obj.bbox else { continue };
            let color = if self.policy.is_critical(&obj.kind) {
                overlay::CRITICAL_COLOR
            } else {
                overlay::NORMAL_COLOR
            };
            overlay::draw_box(&mut canvas, [b[0] as f32, b[1] as f32, b[2] as f32, b[3] as f32], color);
        }
        let dir = self.objects.root().join("annotated");
        let path = dir.join(format!("{frame_id}.jpg"));
        let written = std::fs::create_dir_all(&dir)
            .and_then(|_| overlay::write_jpeg_atomic(&path, &canvas, self.cfg.vision.jpeg_quality));
        match written {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), "failed to write annotated frame: {e}");
                None
            }
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp"))
        .unwrap_or(false)
}

fn newest_image(dir: &Path) -> Option<(PathBuf, SystemTime)> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| is_image(p))
        .filter_map(|p| {
            let modified = p.metadata().and_then(|m| m.modified()).ok()?;
            Some((p, modified))
        })
        .max_by_key(|(_, modified)| *modified)
}

/// New-file detection for the directory watcher. A file is reported once its
/// size is non-zero and unchanged between two consecutive scans.
#[derive(Debug, Default)]
struct SettleTracker {
    seen: HashSet<PathBuf>,
    pending: HashMap<PathBuf, u64>,
}

impl SettleTracker {
    fn with_existing(existing: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            seen: existing.into_iter().collect(),
            pending: HashMap::new(),
        }
    }

    /// One directory scan of `(path, size)`; returns the files that settled, sorted.
    fn scan(&mut self, entries: impl IntoIterator<Item = (PathBuf, u64)>) -> Vec<PathBuf> {
        let mut present = HashSet::new();
        let mut settled = Vec::new();
        for (path, len) in entries {
            if self.seen.contains(&path) {
                continue;
            }
            present.insert(path.clone());
            match self.pending.insert(path.clone(), len) {
                Some(prev) if prev == len && len > 0 => settled.push(path),
                _ => {}
            }
        }
        self.pending.retain(|p, _| present.contains(p));
        for path in &settled {
            self.pending.remove(path);
            self.seen.insert(path.clone());
        }
        settled.sort();
        settled
    }
}

fn image_sizes(dir: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
    Ok(std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter_map(|e| {
            let path = e.path();
            let len = e.metadata().ok()?.len();
            is_image(&path).then_some((path, len))
        })
        .collect())
}

/// Polls `dir` for image files that were not present before, one notification
/// each once the file has stopped growing.
pub fn watch_directory(
    dir: PathBuf,
    poll: Duration,
    shutdown: Shutdown,
) -> Result<(Receiver<FrameNotification>, JoinHandle<()>), FusionError> {
    let existing = std::fs::read_dir(&dir)
        .map_err(|e| FusionError::io(&dir, e))?
        .filter_map(Result::ok)
        .map(|e| e.path());
    let mut tracker = SettleTracker::with_existing(existing);
    let (tx, rx) = bounded(NOTIFICATION_CAPACITY);

    let handle = std::thread::Builder::new()
        .name("edgeguard-watch".to_string())
        .spawn(move || {
            info!(dir = %dir.display(), "watching for frames");
            while !shutdown.wait_timeout(poll) {
                let entries = match image_sizes(&dir) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(dir = %dir.display(), "watch failed: {e}");
                        continue;
                    }
                };
                for path in tracker.scan(entries) {
                    let note = FrameNotification {
                        path,
                        received_at: crate::unix_now(),
                    };
                    if tx.send(note).is_err() {
                        return;
                    }
                }
            }
        })
        .map_err(|e| FusionError::io(Path::new("edgeguard-watch"), e))?;
    Ok((rx, handle))
}
