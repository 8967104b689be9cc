// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod cloud; // 云端融合服务
pub mod config; // 配置参数
pub mod detection; // 边缘检测系统
pub mod egress; // 视频外发进程监管
pub mod error; // 错误类型
pub mod input; // 视频输入系统
pub mod overlay; // 检测框绘制
pub mod pipeline; // 边缘流水线
pub mod safety; // 安全状态与指令监听
pub mod telemetry; // 检测结果上报
pub mod transport; // 发布/订阅传输
pub mod types; // 公共数据结构

pub use crate::config::{EdgeConfig, FusionConfig};
pub use crate::error::PipelineError;
pub use crate::pipeline::{EdgePipeline, Handoff, Offer, Shutdown};
pub use crate::safety::{SafetyHandle, SafetyState, SafetyWriter};
pub use crate::types::{Command, CommandKind, Detection, DetectionBatch, Frame, Mode, Provenance};

/// Wall-clock seconds since the unix epoch, with sub-second precision.
pub fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

/// Class-agnostic greedy NMS over `[x1, y1, x2, y2]` boxes, highest confidence first.
pub fn non_max_suppression<T>(
    xs: &mut Vec<T>,
    iou_threshold: f32,
    key: impl Fn(&T) -> ([f32; 4], f32),
) {
    xs.sort_by(|b1, b2| key(b2).1.total_cmp(&key(b1).1));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = box_iou(&key(&xs[prev_index]).0, &key(&xs[index]).0);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let l = a[0].max(b[0]);
    let r = a[2].min(b[2]);
    let t = a[1].max(b[1]);
    let btm = a[3].min(b[3]);
    let inter = (r - l).max(0.) * (btm - t).max(0.);
    let area = |x: &[f32; 4]| (x[2] - x[0]).max(0.) * (x[3] - x[1]).max(0.);
    let union = area(a) + area(b) - inter;
    if union <= 0. {
        0.
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_highest_of_overlapping_pair() {
        let mut xs = vec![
            ([0., 0., 10., 10.], 0.6),
            ([1., 1., 10., 10.], 0.9),
            ([50., 50., 60., 60.], 0.4),
        ];
        non_max_suppression(&mut xs, 0.45, |x| (x.0, x.1));
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].1, 0.9);
        assert_eq!(xs[1].1, 0.4);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(box_iou(&[0., 0., 1., 1.], &[2., 2., 3., 3.]), 0.);
        assert!((box_iou(&[0., 0., 2., 2.], &[0., 0., 2., 2.]) - 1.).abs() < 1e-6);
    }

    #[test]
    fn unix_now_is_after_2020() {
        assert!(unix_now() > 1_577_836_800.0);
    }
}
