// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 图片循环输入 (still image / image directory loop)

use super::{FrameSource, SourceError};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub struct ImageLoopSource {
    files: Vec<PathBuf>,
    cursor: usize,
    looping: bool,
    period: Duration,
    next_due: Option<Instant>,
    cached: Option<RgbImage>,
}

impl ImageLoopSource {
    pub fn open(path: &Path, fps: u32, looping: bool) -> Result<Self, SourceError> {
        let files = if path.is_dir() {
            let entries = std::fs::read_dir(path).map_err(|e| SourceError::open(path.display().to_string(), e))?;
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && image::ImageFormat::from_path(p).is_ok())
                .collect();
            files.sort();
            files
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        };
        if files.is_empty() {
            return Err(SourceError::open(path.display().to_string(), "no readable images"));
        }
        // a single still is decoded once
        let cached = if files.len() == 1 {
            Some(load(&files[0]).map_err(|e| SourceError::open(files[0].display().to_string(), e))?)
        } else {
            None
        };
        Ok(Self {
            files,
            cursor: 0,
            looping,
            period: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            next_due: None,
            cached,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn pace(&mut self) {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + self.period);
    }
}

fn load(path: &Path) -> Result<RgbImage, String> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| e.to_string())
}

impl FrameSource for ImageLoopSource {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        if self.cursor >= self.files.len() {
            if !self.looping {
                return Err(SourceError::Exhausted);
            }
            self.cursor = 0;
        }
        self.pace();
        let idx = self.cursor;
        self.cursor += 1;
        if let Some(img) = &self.cached {
            return Ok(img.clone());
        }
        load(&self.files[idx])
            .map_err(|e| SourceError::Read(format!("{}: {e}", self.files[idx].display())))
    }

    fn describe(&self) -> String {
        format!("image loop ({} files)", self.files.len())
    }
}
