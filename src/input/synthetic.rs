// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 合成测试画面: a box sweeping across a gradient, for dry runs without a camera.

use super::{FrameSource, SourceError};
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

pub struct SyntheticSource {
    width: u32,
    height: u32,
    period: Duration,
    next_due: Option<Instant>,
    tick: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            period: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            next_due: None,
            tick: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + self.period);

        let (w, h) = (self.width, self.height);
        let side = (w.min(h) / 4).max(1);
        let x0 = (self.tick * 4) % w;
        let y0 = (h - side.min(h)) / 2;
        self.tick = self.tick.wrapping_add(1);
        Ok(RgbImage::from_fn(w, h, |x, y| {
            if x >= x0 && x < x0 + side && y >= y0 && y < y0 + side {
                Rgb([230, 40, 40])
            } else {
                Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, 96])
            }
        }))
    }

    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }
}
