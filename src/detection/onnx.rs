// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 ONNX 检测器
// 包含: 模型加载、letterbox 预处理、推理、后处理 (argmax + NMS)

use super::{Detector, DetectorError, RawDetection};
use crate::config::DetectorConfig;
use crate::non_max_suppression;
use image::{imageops, RgbImage};
use ndarray::{s, Array, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::{debug, info};

const CXYWH_OFFSET: usize = 4;

pub struct OnnxDetector {
    session: Session,
    input_name: String,
    size: u32,
    conf: f32,
    iou: f32,
}

fn load_err(cfg: &DetectorConfig, e: impl std::fmt::Display) -> DetectorError {
    DetectorError::Load {
        path: cfg.model_path.clone(),
        reason: e.to_string(),
    }
}

fn infer_err(e: impl std::fmt::Display) -> DetectorError {
    DetectorError::Inference(e.to_string())
}

impl OnnxDetector {
    pub fn load(cfg: &DetectorConfig) -> Result<Self, DetectorError> {
        if !cfg.model_path.exists() {
            return Err(load_err(cfg, "model file does not exist"));
        }
        let session = Session::builder()
            .map_err(|e| load_err(cfg, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_err(cfg, e))?
            .with_intra_threads(4)
            .map_err(|e| load_err(cfg, e))?
            .commit_from_file(&cfg.model_path)
            .map_err(|e| load_err(cfg, e))?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| load_err(cfg, "model has no inputs"))?;
        info!(model = %cfg.model_path.display(), input = %input_name, "onnx model loaded");
        Ok(Self {
            session,
            input_name,
            size: cfg.input_size,
            conf: cfg.confidence_threshold,
            iou: cfg.iou_threshold,
        })
    }

    fn scale_wh(&self, w0: f32, h0: f32) -> (f32, f32, f32) {
        let s = self.size as f32;
        let r = (s / w0).min(s / h0);
        (r, (w0 * r).round(), (h0 * r).round())
    }

    /// Letterbox into the top-left corner, padding with 144/255.
    fn preprocess(&self, image: &RgbImage) -> Array<f32, ndarray::Ix4> {
        let size = self.size as usize;
        let mut ys = Array::from_elem((1, 3, size, size), 144.0 / 255.0);
        let (_, w_new, h_new) = self.scale_wh(image.width() as f32, image.height() as f32);
        let img = imageops::resize(
            image,
            (w_new as u32).max(1),
            (h_new as u32).max(1),
            imageops::FilterType::Triangle,
        );
        for (x, y, rgb) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = rgb.0;
            ys[[0, 0, y, x]] = (r as f32) / 255.0;
            ys[[0, 1, y, x]] = (g as f32) / 255.0;
            ys[[0, 2, y, x]] = (b as f32) / 255.0;
        }
        ys
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        let t_pre = std::time::Instant::now();
        let (w0, h0) = (image.width() as f32, image.height() as f32);
        let (ratio, _, _) = self.scale_wh(w0, h0);
        let (conf, iou) = (self.conf, self.iou);
        let xs = self.preprocess(image);
        let tensor = Tensor::from_array(xs).map_err(infer_err)?;

        let t_run = std::time::Instant::now();
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(infer_err)?;
        let output = outputs
            .values()
            .next()
            .ok_or_else(|| infer_err("model produced no outputs"))?;
        let preds = output.try_extract_array::<f32>().map_err(infer_err)?;
        let run_ms = t_run.elapsed().as_secs_f64() * 1000.0;

        // [1, 4 + nc, anchors]
        if preds.ndim() != 3 || preds.shape()[1] <= CXYWH_OFFSET {
            return Err(infer_err(format!("unexpected output shape {:?}", preds.shape())));
        }
        let mut data: Vec<RawDetection> = Vec::new();
        let anchors = preds.index_axis(Axis(0), 0);
        for pred in anchors.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..]);
            let Some((id, &confidence)) = clss
                .iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };
            if confidence < conf {
                continue;
            }

            let cx = bbox[0] / ratio;
            let cy = bbox[1] / ratio;
            let w = bbox[2] / ratio;
            let h = bbox[3] / ratio;
            let x1 = (cx - w / 2.).clamp(0., w0);
            let y1 = (cy - h / 2.).clamp(0., h0);
            let x2 = (cx + w / 2.).clamp(0., w0);
            let y2 = (cy + h / 2.).clamp(0., h0);
            data.push(RawDetection::new([x1, y1, x2, y2], id as u32, confidence));
        }

        non_max_suppression(&mut data, iou, |d| (d.bbox, d.confidence));
        debug!(
            pre_ms = (t_run - t_pre).as_secs_f64() * 1000.0,
            run_ms,
            kept = data.len(),
            "onnx inference"
        );
        Ok(data)
    }

    fn name(&self) -> &str {
        "yolov8-onnx"
    }
}
