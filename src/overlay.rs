// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测框绘制 (Detection overlay)
///
/// - draw_box / draw_detections: 在 RgbImage 上绘制检测框
/// - encode_jpeg / write_jpeg_atomic: 预览图与云端存储共用的 JPEG 输出
use crate::types::Detection;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::io;
use std::path::Path;

pub const CRITICAL_COLOR: Rgb<u8> = Rgb([230, 40, 40]);
pub const NORMAL_COLOR: Rgb<u8> = Rgb([40, 200, 80]);

const THICKNESS: i32 = 2;
const TAG_HEIGHT: u32 = 6;

/// Hollow box of `THICKNESS` pixels with a small tag bar above the top-left corner.
/// Boxes are clipped to the image; degenerate boxes are skipped.
pub fn draw_box(img: &mut RgbImage, bbox: [f32; 4], color: Rgb<u8>) {
    let (w, h) = (img.width() as f32, img.height() as f32);
    if !bbox.iter().all(|v| v.is_finite()) {
        return;
    }
    let x1 = bbox[0].clamp(0., w - 1.) as i32;
    let y1 = bbox[1].clamp(0., h - 1.) as i32;
    let x2 = bbox[2].clamp(0., w - 1.) as i32;
    let y2 = bbox[3].clamp(0., h - 1.) as i32;
    if x2 <= x1 || y2 <= y1 {
        return;
    }

    for offset in 0..THICKNESS {
        let (bw, bh) = ((x2 - x1 - 2 * offset).max(1), (y2 - y1 - 2 * offset).max(1));
        let rect = Rect::at(x1 + offset, y1 + offset).of_size(bw as u32, bh as u32);
        draw_hollow_rect_mut(img, rect, color);
    }

    let tag_w = ((x2 - x1) as u32).min(48).max(1);
    let tag_y = (y1 - TAG_HEIGHT as i32).max(0);
    draw_filled_rect_mut(img, Rect::at(x1, tag_y).of_size(tag_w, TAG_HEIGHT), color);
}

/// Draws every detection, red when `is_critical(label)` holds and green otherwise.
pub fn draw_detections(img: &mut RgbImage, detections: &[Detection], is_critical: impl Fn(&str) -> bool) {
    for d in detections {
        let color = if is_critical(&d.label) {
            CRITICAL_COLOR
        } else {
            NORMAL_COLOR
        };
        draw_box(img, d.bbox, color);
    }
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(img)?;
    Ok(buffer)
}

/// Writes next to `path` and renames over it, so readers never see a torn file.
pub fn write_jpeg_atomic(path: &Path, img: &RgbImage, quality: u8) -> io::Result<()> {
    let bytes = encode_jpeg(img, quality).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provenance;

    fn det(label: &str, bbox: [f32; 4]) -> Detection {
        Detection {
            bbox,
            label: label.to_string(),
            class_id: 0,
            confidence: 0.9,
            provenance: Provenance::Edge,
        }
    }

    #[test]
    fn critical_boxes_are_red() {
        let mut img = RgbImage::new(100, 100);
        draw_detections(
            &mut img,
            &[det("person", [10., 20., 60., 80.]), det("car", [70., 70., 95., 95.])],
            |l| l == "person",
        );
        assert_eq!(*img.get_pixel(30, 79), CRITICAL_COLOR);
        assert_eq!(*img.get_pixel(80, 94), NORMAL_COLOR);
        // interior untouched
        assert_eq!(*img.get_pixel(35, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn out_of_frame_and_degenerate_boxes_do_not_panic() {
        let mut img = RgbImage::new(16, 16);
        draw_box(&mut img, [-50., -50., 500., 500.], NORMAL_COLOR);
        draw_box(&mut img, [8., 8., 4., 4.], NORMAL_COLOR);
        draw_box(&mut img, [f32::NAN, 0., 4., 4.], NORMAL_COLOR);
    }

    #[test]
    fn atomic_write_leaves_decodable_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let img = RgbImage::from_pixel(32, 24, Rgb([200, 10, 10]));
        write_jpeg_atomic(&path, &img, 80).unwrap();
        let back = image::open(&path).unwrap();
        assert_eq!((back.width(), back.height()), (32, 24));
        assert!(!dir.path().join("preview.jpg.tmp").exists());
    }
}
