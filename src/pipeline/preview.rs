// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 预览输出 (display path): latest annotated frame rewritten to a JPEG file.

use super::Shutdown;
use crate::detection::worker::Annotated;
use crate::overlay;
use crate::pipeline::Handoff;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const PREVIEW_QUALITY: u8 = 80;

pub struct PreviewWriter {
    input: Handoff<Annotated>,
    path: PathBuf,
    critical: HashSet<String>,
    written: u64,
}

impl PreviewWriter {
    pub fn new(input: Handoff<Annotated>, path: PathBuf, critical: impl IntoIterator<Item = String>) -> Self {
        Self {
            input,
            path,
            critical: critical.into_iter().map(|s| s.to_lowercase()).collect(),
            written: 0,
        }
    }

    fn write(&mut self, annotated: Annotated) {
        let Annotated { frame, batch } = annotated;
        let mut image = frame.image;
        overlay::draw_detections(&mut image, &batch.detections, |label| {
            self.critical.contains(&label.to_lowercase())
        });
        match overlay::write_jpeg_atomic(&self.path, &image, PREVIEW_QUALITY) {
            Ok(()) => {
                self.written += 1;
                debug!(seq = frame.seq, detections = batch.len(), "preview updated");
            }
            Err(e) => warn!(path = %self.path.display(), "preview write failed: {e}"),
        }
    }

    pub fn run(mut self, shutdown: Shutdown) {
        info!(path = %self.path.display(), "preview started");
        while let Some(annotated) = self.input.take(&shutdown) {
            self.write(annotated);
        }
        info!(written = self.written, "preview stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Detection, DetectionBatch, Frame, Provenance};
    use image::RgbImage;
    use std::time::{Duration, Instant};

    #[test]
    fn writes_annotated_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let input = Handoff::latest();
        let writer = PreviewWriter::new(input.clone(), path.clone(), vec!["person".to_string()]);
        let shutdown = Shutdown::new();
        let s = shutdown.clone();
        let t = std::thread::spawn(move || writer.run(s));

        let det = Detection {
            bbox: [2., 2., 20., 20.],
            label: "person".into(),
            class_id: 0,
            confidence: 0.9,
            provenance: Provenance::Edge,
        };
        let frame = Frame::new(0, RgbImage::new(32, 32));
        let batch = DetectionBatch::new(frame.timestamp, vec![det], Provenance::Edge);
        input.offer(Annotated { frame, batch });

        let deadline = Instant::now() + Duration::from_secs(2);
        while !path.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown.cancel();
        t.join().unwrap();
        assert_eq!(image::open(&path).unwrap().width(), 32);
    }
}
