// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 边缘检测系统 (Edge detection system)
///
/// 独立工作线程, 负责限速推理
/// - Detector:        推理模型接口 (ONNX YOLOv8 或自定义实现)
/// - DetectionFilter: 类别白名单 + 置信度阈值
/// - DetectionWorker: 按推理间隔取帧 → 检测 → 输出检测批次
pub mod names;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod worker;

pub use names::{class_name, COCO_NAMES};
#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;
pub use worker::DetectionWorker;

use crate::config::DetectorConfig;
use crate::types::{Detection, Provenance};
use image::RgbImage;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to load model {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("detector unavailable: {0}")]
    Unavailable(String),
}

/// One raw model output in source-frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: [f32; 4],
    pub class_id: u32,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(bbox: [f32; 4], class_id: u32, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
        }
    }
}

/// Inference model seam. Called from the worker thread only.
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// Loads the configured model. Failure here is startup-fatal.
pub fn load_detector(cfg: &DetectorConfig) -> Result<Box<dyn Detector>, DetectorError> {
    #[cfg(feature = "onnx")]
    {
        Ok(Box::new(OnnxDetector::load(cfg)?))
    }
    #[cfg(not(feature = "onnx"))]
    {
        Err(DetectorError::Unavailable(format!(
            "cannot load {}: built without the `onnx` feature",
            cfg.model_path.display()
        )))
    }
}

/// Allow-list plus strict confidence threshold.
#[derive(Debug, Clone)]
pub struct DetectionFilter {
    allow: HashSet<u32>,
    threshold: f32,
}

impl DetectionFilter {
    pub fn new(allow: impl IntoIterator<Item = u32>, threshold: f32) -> Self {
        Self {
            allow: allow.into_iter().collect(),
            threshold,
        }
    }

    pub fn from_config(cfg: &DetectorConfig) -> Self {
        Self::new(cfg.classes_of_interest.iter().copied(), cfg.confidence_threshold)
    }

    pub fn keeps(&self, raw: &RawDetection) -> bool {
        self.allow.contains(&raw.class_id) && raw.confidence > self.threshold
    }

    /// Kept detections in model order, plus the number of malformed boxes discarded.
    pub fn apply(&self, raw: Vec<RawDetection>) -> (Vec<Detection>, u64) {
        let mut malformed = 0;
        let mut kept = Vec::new();
        for r in raw {
            if !self.keeps(&r) {
                continue;
            }
            let d = Detection {
                bbox: r.bbox,
                label: class_name(r.class_id),
                class_id: r.class_id,
                confidence: r.confidence,
                provenance: Provenance::Edge,
            };
            if d.is_well_formed() {
                kept.push(d);
            } else {
                malformed += 1;
            }
        }
        (kept, malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_requires_allow_list_and_confidence() {
        let filter = DetectionFilter::new([0, 2], 0.3);
        let raw = vec![
            RawDetection::new([0., 0., 5., 5.], 0, 0.9),
            RawDetection::new([0., 0., 5., 5.], 2, 0.3),
            RawDetection::new([0., 0., 5., 5.], 9, 0.99),
            RawDetection::new([0., 0., 5., 5.], 2, 0.31),
        ];
        let (kept, malformed) = filter.apply(raw);
        assert_eq!(malformed, 0);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].label, "person");
        assert_eq!(kept[1].label, "car");
        assert_eq!(kept[1].confidence, 0.31);
    }

    #[test]
    fn malformed_boxes_are_counted_not_kept() {
        let filter = DetectionFilter::new([0], 0.3);
        let (kept, malformed) = filter.apply(vec![
            RawDetection::new([10., 0., 5., 5.], 0, 0.9),
            RawDetection::new([0., f32::INFINITY, 5., 5.], 0, 0.9),
            RawDetection::new([0., 0., 5., 5.], 0, 0.9),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(malformed, 2);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn loading_without_onnx_feature_is_an_error() {
        assert!(matches!(
            load_detector(&DetectorConfig::default()),
            Err(DetectorError::Unavailable(_))
        ));
    }
}
