// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 公共数据结构定义
/// Data structures shared by the edge pipeline and the fusion service
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

// ========== 枚举类型 ==========

/// Which model produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    #[default]
    Edge,
    Cloud,
}

/// Safety mode gating actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Stop,
    Resume,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Stop => "stop",
            CommandKind::Resume => "resume",
        }
    }

    /// Mode a command forces once applied.
    pub fn target_mode(&self) -> Mode {
        match self {
            CommandKind::Stop => Mode::Stopped,
            CommandKind::Resume => Mode::Running,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(CommandKind::Stop),
            "resume" => Ok(CommandKind::Resume),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

// ========== 数据结构 ==========

/// 采集帧 (采集线程 → 检测线程)
#[derive(Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: Instant,
    /// Wall-clock capture time in unix seconds.
    pub timestamp: f64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(seq: u64, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at: Instant::now(),
            timestamp: crate::unix_now(),
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("timestamp", &self.timestamp)
            .field("size", &format_args!("{}x{}", self.width(), self.height()))
            .finish()
    }
}

/// 检测框 (Detection bounding box), source-frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    #[serde(rename = "class")]
    pub label: String,
    pub class_id: u32,
    pub confidence: f32,
    #[serde(skip)]
    pub provenance: Provenance,
}

impl Detection {
    pub fn x1(&self) -> f32 {
        self.bbox[0]
    }

    pub fn y1(&self) -> f32 {
        self.bbox[1]
    }

    pub fn x2(&self) -> f32 {
        self.bbox[2]
    }

    pub fn y2(&self) -> f32 {
        self.bbox[3]
    }

    /// Finite coordinates with `x1 <= x2` and `y1 <= y2`.
    pub fn is_well_formed(&self) -> bool {
        self.bbox.iter().all(|v| v.is_finite())
            && self.x1() <= self.x2()
            && self.y1() <= self.y2()
            && (0.0..=1.0).contains(&self.confidence)
    }
}

/// 检测批次 (检测线程 → 上报线程), immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawBatch")]
pub struct DetectionBatch {
    pub timestamp: f64,
    pub detections: Vec<Detection>,
    pub source: Provenance,
}

#[derive(Deserialize)]
struct RawBatch {
    timestamp: f64,
    #[serde(default)]
    detections: Vec<Detection>,
    #[serde(default)]
    source: Provenance,
}

impl From<RawBatch> for DetectionBatch {
    fn from(raw: RawBatch) -> Self {
        DetectionBatch::new(raw.timestamp, raw.detections, raw.source)
    }
}

impl DetectionBatch {
    /// Stamps every detection with the batch provenance.
    pub fn new(timestamp: f64, mut detections: Vec<Detection>, source: Provenance) -> Self {
        for d in detections.iter_mut() {
            d.provenance = source;
        }
        Self {
            timestamp,
            detections,
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// 安全指令 (云端/操作员 → 边缘)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    #[serde(rename = "command")]
    pub kind: CommandKind,
    pub reason: String,
    pub timestamp: f64,
    pub issuer: String,
}

#[derive(Deserialize)]
struct WireCommand {
    command: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    issuer: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandDecodeError {
    #[error("invalid command json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    UnknownKind(String),
    #[error("non-finite command timestamp")]
    BadTimestamp,
}

impl Command {
    pub fn new(kind: CommandKind, reason: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            timestamp: crate::unix_now(),
            issuer: issuer.into(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Decodes a wire payload. A missing timestamp is replaced by `received_at`.
    pub fn decode(payload: &[u8], received_at: f64) -> Result<Self, CommandDecodeError> {
        let wire: WireCommand = serde_json::from_slice(payload)?;
        let kind = wire
            .command
            .parse::<CommandKind>()
            .map_err(CommandDecodeError::UnknownKind)?;
        let timestamp = wire.timestamp.unwrap_or(received_at);
        if !timestamp.is_finite() {
            return Err(CommandDecodeError::BadTimestamp);
        }
        Ok(Self {
            kind,
            reason: wire.reason,
            timestamp,
            issuer: wire.issuer.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> Detection {
        Detection {
            bbox: [10., 10., 50., 50.],
            label: "person".into(),
            class_id: 0,
            confidence: 0.81,
            provenance: Provenance::Edge,
        }
    }

    #[test]
    fn batch_serializes_to_topic_shape() {
        let batch = DetectionBatch::new(1718000000.5, vec![person()], Provenance::Edge);
        let value: serde_json::Value = serde_json::from_slice(&batch.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "timestamp": 1718000000.5,
                "detections": [
                    {"box": [10.0, 10.0, 50.0, 50.0], "class": "person", "class_id": 0, "confidence": 0.81}
                ],
                "source": "edge"
            })
        );

        let back: DetectionBatch = serde_json::from_value(value).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn cloud_batch_restores_detection_provenance() {
        let batch = DetectionBatch::new(1.0, vec![person()], Provenance::Cloud);
        let back: DetectionBatch = serde_json::from_slice(&batch.to_json().unwrap()).unwrap();
        assert_eq!(back.detections[0].provenance, Provenance::Cloud);
    }

    #[test]
    fn command_accepts_integer_timestamp() {
        let cmd = Command::decode(br#"{"command":"stop","reason":"x","timestamp":1700000000}"#, 5.0)
            .unwrap();
        assert_eq!(cmd.kind, CommandKind::Stop);
        assert_eq!(cmd.timestamp, 1_700_000_000.0);
        assert_eq!(cmd.issuer, "unknown");
    }

    #[test]
    fn command_without_timestamp_uses_receipt_time() {
        let cmd = Command::decode(br#"{"command":"resume"}"#, 42.5).unwrap();
        assert_eq!(cmd.kind, CommandKind::Resume);
        assert_eq!(cmd.timestamp, 42.5);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(matches!(
            Command::decode(br#"{"command":"reverse","timestamp":1}"#, 0.0),
            Err(CommandDecodeError::UnknownKind(_))
        ));
        assert!(Command::decode(b"not json", 0.0).is_err());
    }

    #[test]
    fn malformed_boxes_are_detected() {
        let mut d = person();
        assert!(d.is_well_formed());
        d.bbox = [50., 10., 10., 50.];
        assert!(!d.is_well_formed());
        d.bbox = [f32::NAN, 0., 1., 1.];
        assert!(!d.is_well_formed());
    }
}
