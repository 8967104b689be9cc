// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 配置参数 (Configuration)
///
/// TOML 文件 + 命令行覆盖:
/// - EdgeConfig:   边缘节点 (采集/检测/上报/指令/视频外发)
/// - FusionConfig: 云端融合服务 (视觉模型/停车策略/存储)
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration value: {field} ({reason})")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// `~/.config/edgeguard/<file>` on Linux, the platform equivalent elsewhere.
pub fn default_config_path(file: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("edgeguard").join(file))
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Explicit path must exist; without one the default location is tried, then defaults.
fn load_or_default<T>(path: Option<&Path>, file: &str) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match path {
        Some(p) => read_toml(p),
        None => match default_config_path(file) {
            Some(p) if p.exists() => read_toml(&p),
            _ => Ok(T::default()),
        },
    }
}

// ========== 边缘节点 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    #[default]
    Rtsp,
    File,
    Synthetic,
}

/// Handoff policy for the frame buffer and the detection channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Sharing {
    #[default]
    Queue,
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub url: String,
    /// Camera device; index on macOS, `/dev/videoN` index on Linux, name on Windows.
    pub device: String,
    pub path: PathBuf,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub loop_file: bool,
    pub retry_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Rtsp,
            url: "rtsp://127.0.0.1:554/live".to_string(),
            device: "0".to_string(),
            path: PathBuf::from("video.mp4"),
            fps: 15,
            width: 1280,
            height: 720,
            loop_file: true,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub display: bool,
    pub detection_sharing: Sharing,
    pub frame_sharing: Sharing,
    pub yolo_enabled: bool,
    pub frame_buffer_capacity: usize,
    pub detection_channel_capacity: usize,
    /// Annotated JPEG rewritten on every processed frame when `display` is set.
    pub preview_path: PathBuf,
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            display: false,
            detection_sharing: Sharing::Queue,
            frame_sharing: Sharing::Queue,
            yolo_enabled: true,
            frame_buffer_capacity: 10,
            detection_channel_capacity: 10,
            preview_path: PathBuf::from("preview.jpg"),
            shutdown_timeout_ms: 2000,
        }
    }
}

/// COCO ids kept by default: person, bicycle, car, motorcycle, bus, train, truck, dog, horse, sheep.
pub const DEFAULT_CLASSES_OF_INTEREST: [u32; 10] = [0, 1, 2, 3, 5, 6, 7, 16, 17, 18];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub classes_of_interest: Vec<u32>,
    pub interval_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolov8n.onnx"),
            input_size: 640,
            confidence_threshold: 0.3,
            iou_threshold: 0.45,
            classes_of_interest: DEFAULT_CLASSES_OF_INTEREST.to_vec(),
            interval_ms: 200,
            error_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub publish_interval_ms: u64,
    /// Zero disables the heartbeat topic.
    pub heartbeat_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 1000,
            heartbeat_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Mqtt,
    /// In-process loopback bus, no broker.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    /// Empty means the device id.
    pub client_id: String,
    pub tls: bool,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Outgoing requests buffered while the connection is down.
    pub request_capacity: usize,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Mqtt,
            host: "localhost".to_string(),
            port: 8883,
            client_id: String::new(),
            tls: true,
            ca_path: PathBuf::from("certs/AmazonRootCA1.pem"),
            cert_path: PathBuf::from("certs/device.pem.crt"),
            key_path: PathBuf::from("certs/private.pem.key"),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            request_capacity: 1024,
            reconnect_min_ms: 1000,
            reconnect_max_ms: 32000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// gst-launch RTSP passthrough into kvssink.
    Passthrough,
    /// Producer SDK sample binary reading RTSP.
    Sample,
    /// Producer SDK sample binary reading RTMP.
    Rtmp,
    /// gst-launch transcoding a local video file.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    pub enabled: bool,
    pub stream_name: String,
    pub region: String,
    pub strategies: Vec<StrategyKind>,
    pub producer_path: PathBuf,
    pub rtmp_url: String,
    pub storage_size_mb: u32,
    pub fragment_duration_ms: u32,
    pub max_latency_ms: u32,
    pub probe_grace_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Local credential directory, mirrored into `producer_path`.
    pub credential_dir: PathBuf,
    /// Profile read from the shared AWS credentials file when the environment has none.
    pub aws_profile: String,
    pub gst_debug: u8,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stream_name: "adrve-video-stream".to_string(),
            region: "us-west-2".to_string(),
            strategies: vec![StrategyKind::Passthrough, StrategyKind::Sample, StrategyKind::Rtmp],
            producer_path: PathBuf::from("amazon-kinesis-video-streams-producer-sdk-cpp/build"),
            rtmp_url: "rtmp://127.0.0.1:1935/live/test".to_string(),
            storage_size_mb: 512,
            fragment_duration_ms: 2000,
            max_latency_ms: 0,
            probe_grace_ms: 1000,
            shutdown_timeout_ms: 2000,
            credential_dir: PathBuf::from(".kvs"),
            aws_profile: "default".to_string(),
            gst_debug: 2,
        }
    }
}

/// 边缘节点配置 (Edge node configuration)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub device_id: String,
    pub topic_prefix: String,
    pub debug: bool,
    pub source: SourceConfig,
    pub pipeline: PipelineConfig,
    pub detector: DetectorConfig,
    pub telemetry: TelemetryConfig,
    pub transport: TransportConfig,
    pub egress: EgressConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            device_id: "adrve_edge".to_string(),
            topic_prefix: "adrve".to_string(),
            debug: false,
            source: SourceConfig::default(),
            pipeline: PipelineConfig::default(),
            detector: DetectorConfig::default(),
            telemetry: TelemetryConfig::default(),
            transport: TransportConfig::default(),
            egress: EgressConfig::default(),
        }
    }
}

impl EdgeConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_toml(path.as_ref())
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_or_default(path, "edge.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ids(&self.device_id, &self.topic_prefix)?;
        if self.source.fps == 0 {
            return Err(ConfigError::invalid("source.fps", "must be positive"));
        }
        if matches!(self.source.kind, SourceKind::Rtsp) && self.source.url.is_empty() {
            return Err(ConfigError::invalid("source.url", "required for rtsp sources"));
        }
        if self.pipeline.frame_buffer_capacity == 0 {
            return Err(ConfigError::invalid("pipeline.frame_buffer_capacity", "must be positive"));
        }
        if self.pipeline.detection_channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "pipeline.detection_channel_capacity",
                "must be positive",
            ));
        }
        let d = &self.detector;
        if !(0.0..=1.0).contains(&d.confidence_threshold) {
            return Err(ConfigError::invalid(
                "detector.confidence_threshold",
                format!("{} is outside [0, 1]", d.confidence_threshold),
            ));
        }
        if !(0.0..=1.0).contains(&d.iou_threshold) {
            return Err(ConfigError::invalid("detector.iou_threshold", "outside [0, 1]"));
        }
        if d.input_size == 0 || d.input_size % 32 != 0 {
            return Err(ConfigError::invalid("detector.input_size", "must be a multiple of 32"));
        }
        if self.telemetry.publish_interval_ms == 0 {
            return Err(ConfigError::invalid("telemetry.publish_interval_ms", "must be positive"));
        }
        self.transport.validate()?;
        if self.egress.enabled {
            if self.egress.strategies.is_empty() {
                return Err(ConfigError::invalid("egress.strategies", "at least one strategy"));
            }
            if self.egress.stream_name.is_empty() {
                return Err(ConfigError::invalid("egress.stream_name", "must not be empty"));
            }
        }
        Ok(())
    }

    pub fn inference_interval(&self) -> Duration {
        Duration::from_millis(self.detector.interval_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry.publish_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.shutdown_timeout_ms)
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == TransportKind::Local {
            return Ok(());
        }
        if self.host.is_empty() {
            return Err(ConfigError::invalid("transport.host", "must not be empty"));
        }
        if self.reconnect_min_ms == 0 || self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(ConfigError::invalid(
                "transport.reconnect_min_ms",
                "must be positive and not exceed reconnect_max_ms",
            ));
        }
        if self.request_capacity == 0 {
            return Err(ConfigError::invalid("transport.request_capacity", "must be positive"));
        }
        Ok(())
    }

    pub fn client_id_or<'a>(&'a self, device_id: &'a str) -> &'a str {
        if self.client_id.is_empty() {
            device_id
        } else {
            &self.client_id
        }
    }
}

fn validate_ids(device_id: &str, topic_prefix: &str) -> Result<(), ConfigError> {
    for (field, value) in [("device_id", device_id), ("topic_prefix", topic_prefix)] {
        if value.is_empty() {
            return Err(ConfigError::invalid(field, "must not be empty"));
        }
        if value.contains(['/', '+', '#']) {
            return Err(ConfigError::invalid(field, format!("'{value}' contains topic separators")));
        }
    }
    Ok(())
}

// ========== 云端融合服务 ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub critical_types: Vec<String>,
    /// Strict lower bound.
    pub critical_confidence: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            critical_types: ["human", "person", "pedestrian", "animal", "dog", "cat"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            critical_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub api_version: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub jpeg_quality: u8,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-sonnet-20240229".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            api_version: "2023-06-01".to_string(),
            max_tokens: 1000,
            timeout_secs: 30,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Object store root; frames land under `frames/YYYY/MM/DD/HH/`.
    pub root: PathBuf,
    pub record_file: PathBuf,
    pub ttl_days: u32,
    pub annotate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("fusion-data"),
            record_file: PathBuf::from("fusion-data/records.jsonl"),
            ttl_days: 7,
            annotate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameFeedConfig {
    /// Directory the ingestion side drops frames into.
    pub dir: PathBuf,
    pub interval_secs: u64,
    pub poll_ms: u64,
}

impl Default for FrameFeedConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("frames-in"),
            interval_secs: 10,
            poll_ms: 500,
        }
    }
}

/// 云端融合配置 (Fusion service configuration)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub device_id: String,
    pub topic_prefix: String,
    pub debug: bool,
    pub policy: PolicyConfig,
    pub vision: VisionConfig,
    pub storage: StorageConfig,
    pub frames: FrameFeedConfig,
    pub transport: TransportConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            device_id: "adrve_edge".to_string(),
            topic_prefix: "adrve".to_string(),
            debug: false,
            policy: PolicyConfig::default(),
            vision: VisionConfig::default(),
            storage: StorageConfig::default(),
            frames: FrameFeedConfig::default(),
            transport: TransportConfig {
                client_id: "adrve_fusion".to_string(),
                ..TransportConfig::default()
            },
        }
    }
}

impl FusionConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_toml(path.as_ref())
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        load_or_default(path, "fusion.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ids(&self.device_id, &self.topic_prefix)?;
        if !(0.0..=1.0).contains(&self.policy.critical_confidence) {
            return Err(ConfigError::invalid("policy.critical_confidence", "outside [0, 1]"));
        }
        if self.policy.critical_types.is_empty() {
            return Err(ConfigError::invalid("policy.critical_types", "must not be empty"));
        }
        if self.vision.endpoint.is_empty() {
            return Err(ConfigError::invalid("vision.endpoint", "must not be empty"));
        }
        if !(1..=100).contains(&self.vision.jpeg_quality) {
            return Err(ConfigError::invalid("vision.jpeg_quality", "must be in 1..=100"));
        }
        if self.frames.interval_secs == 0 {
            return Err(ConfigError::invalid("frames.interval_secs", "must be positive"));
        }
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        EdgeConfig::default().validate().unwrap();
        FusionConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: EdgeConfig = toml::from_str(
            r#"
            device_id = "truck_7"
            [pipeline]
            detection_sharing = "latest"
            [source]
            kind = "file"
            path = "clip.mp4"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.device_id, "truck_7");
        assert_eq!(cfg.pipeline.detection_sharing, Sharing::Latest);
        assert_eq!(cfg.pipeline.frame_buffer_capacity, 10);
        assert_eq!(cfg.source.kind, SourceKind::File);
        assert_eq!(cfg.detector.classes_of_interest, DEFAULT_CLASSES_OF_INTEREST.to_vec());
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = EdgeConfig::default();
        cfg.detector.confidence_threshold = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "detector.confidence_threshold", .. })
        ));
    }

    #[test]
    fn rejects_topic_separator_in_device_id() {
        let cfg = EdgeConfig {
            device_id: "a/b".into(),
            ..EdgeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reads_file_and_reports_parse_errors() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(good, "[vision]\nmax_tokens = 512").unwrap();
        let cfg = FusionConfig::from_toml_file(good.path()).unwrap();
        assert_eq!(cfg.vision.max_tokens, 512);
        assert_eq!(cfg.policy.critical_confidence, 0.7);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "device_id = [").unwrap();
        assert!(matches!(
            EdgeConfig::from_toml_file(bad.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            EdgeConfig::load(Some(Path::new("/nonexistent/edge.toml"))),
            Err(ConfigError::Io { .. })
        ));
    }
}
