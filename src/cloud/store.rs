// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 帧与检测记录存储 (frame object store + JSONL record store)

use super::vision::VisionObject;
use super::FusionError;
use crate::types::Provenance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Model result as persisted and logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub objects: Vec<VisionObject>,
    pub timestamp: i64,
    pub source: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionReport {
    pub fn cloud(objects: Vec<VisionObject>, timestamp: f64, error: Option<String>) -> Self {
        Self {
            objects,
            timestamp: timestamp as i64,
            source: Provenance::Cloud,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    #[serde(rename = "frameId")]
    pub frame_id: String,
    pub timestamp: i64,
    #[serde(rename = "frameStoragePath")]
    pub frame_storage_path: String,
    #[serde(rename = "detectionResults")]
    pub detection_results: DetectionReport,
    pub ttl: i64,
}

impl FrameRecord {
    pub fn new(frame_id: String, timestamp: f64, key: String, report: DetectionReport, ttl_days: u32) -> Self {
        let ts = timestamp as i64;
        Self {
            frame_id,
            timestamp: ts,
            frame_storage_path: key,
            detection_results: report,
            ttl: ts + i64::from(ttl_days) * SECONDS_PER_DAY,
        }
    }
}

/// `frames/YYYY/MM/DD/HH/<ts>_<id>.jpg`, hour bucket in UTC.
pub fn frame_key(timestamp: f64, frame_id: &str) -> String {
    let secs = timestamp.floor() as i64;
    let bucket = DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format("%Y/%m/%d/%H");
    format!("frames/{bucket}/{timestamp}_{frame_id}.jpg")
}

/// Directory-backed object store.
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, FusionError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FusionError::io(parent, e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| FusionError::io(&path, e))?;
        Ok(path)
    }
}

/// Append-only JSON-lines record store.
pub struct RecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn put(&self, record: &FrameRecord) -> Result<(), FusionError> {
        let mut line = serde_json::to_vec(record).map_err(|e| FusionError::Storage(e.to_string()))?;
        line.push(b'\n');
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FusionError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FusionError::io(&self.path, e))?;
        file.write_all(&line).map_err(|e| FusionError::io(&self.path, e))
    }

    /// Every readable record; corrupt lines are skipped.
    pub fn read_all(&self) -> Result<Vec<FrameRecord>, FusionError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FusionError::io(&self.path, e)),
        };
        Ok(BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|l| serde_json::from_str(&l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_utc_hour_bucket() {
        // 2024-06-10 06:13:20 UTC
        let key = frame_key(1718000000.5, "abc");
        assert_eq!(key, "frames/2024/06/10/06/1718000000.5_abc.jpg");
    }

    #[test]
    fn record_shape_and_ttl() {
        let report = DetectionReport::cloud(vec![VisionObject::new("person", 0.92, Some([1., 2., 3., 4.]))], 1718000000.9, None);
        let record = FrameRecord::new("id-1".into(), 1718000000.9, "frames/x.jpg".into(), report, 7);
        assert_eq!(record.timestamp, 1718000000);
        assert_eq!(record.ttl, 1718000000 + 7 * 86400);

        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["frameId"], "id-1");
        assert_eq!(v["frameStoragePath"], "frames/x.jpg");
        assert_eq!(v["detectionResults"]["source"], "cloud");
        // decimal survives exactly
        let text = serde_json::to_string(&record).unwrap();
        assert!(text.contains("\"confidence\":0.92"));
    }

    #[test]
    fn stores_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let objects = ObjectStore::new(dir.path().join("objects"));
        let path = objects.put("frames/2024/01/01/00/1_a.jpg", b"jpeg").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"jpeg");

        let records = RecordStore::new(dir.path().join("db/records.jsonl"));
        assert!(records.read_all().unwrap().is_empty());
        for id in ["a", "b"] {
            let report = DetectionReport::cloud(Vec::new(), 10.0, Some("model down".into()));
            records.put(&FrameRecord::new(id.into(), 10.0, "k".into(), report, 7)).unwrap();
        }
        let back = records.read_all().unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].frame_id, "b");
        assert_eq!(back[0].detection_results.error.as_deref(), Some("model down"));
    }
}
