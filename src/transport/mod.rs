// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 发布/订阅传输层 (Pub/sub transport)
///
/// - MqttTransport: TLS MQTT 客户端, 自动重连 + 重新订阅
/// - LocalBus:      进程内总线 (单进程运行 / 测试)
pub mod local;
pub mod mqtt;

pub use local::LocalBus;
pub use mqtt::MqttTransport;

use crate::config::{TransportConfig, TransportKind};
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to read TLS material {path}: {source}")]
    Tls {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no connection acknowledgement from {host}:{port} within {secs}s")]
    ConnectTimeout { host: String, port: u16, secs: u64 },

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {filter} failed: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("transport is disconnected")]
    Disconnected,
}

/// One inbound publication.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Fire-and-forget pub/sub. Delivery guarantees belong to the implementation.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Messages matching `filter` (MQTT wildcards allowed) until disconnect.
    fn subscribe(&self, filter: &str) -> Result<Receiver<Message>, TransportError>;

    fn disconnect(&self);
}

/// Opens the configured transport. MQTT blocks until the first ConnAck or timeout.
pub fn connect(cfg: &TransportConfig, device_id: &str) -> Result<Arc<dyn Transport>, TransportError> {
    match cfg.kind {
        TransportKind::Local => Ok(Arc::new(LocalBus::new())),
        TransportKind::Mqtt => Ok(Arc::new(MqttTransport::connect(cfg, cfg.client_id_or(device_id))?)),
    }
}

/// Topic names under prefix `P` for device `D`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    device: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            device: device.into(),
        }
    }

    /// `P/status/D/detection`
    pub fn detection(&self) -> String {
        format!("{}/status/{}/detection", self.prefix, self.device)
    }

    /// `P/commands/D`
    pub fn commands(&self) -> String {
        format!("{}/commands/{}", self.prefix, self.device)
    }

    /// `P/status/D/heartbeat`
    pub fn heartbeat(&self) -> String {
        format!("{}/status/{}/heartbeat", self.prefix, self.device)
    }
}

/// MQTT filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        let t = Topics::new("adrve", "adrve_edge");
        assert_eq!(t.detection(), "adrve/status/adrve_edge/detection");
        assert_eq!(t.commands(), "adrve/commands/adrve_edge");
        assert_eq!(t.heartbeat(), "adrve/status/adrve_edge/heartbeat");
    }

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("a/commands/d", "a/commands/d"));
        assert!(topic_matches("a/status/+/detection", "a/status/d1/detection"));
        assert!(!topic_matches("a/status/+/detection", "a/status/d1/heartbeat"));
        assert!(topic_matches("a/#", "a/status/d1/heartbeat"));
        assert!(!topic_matches("a/commands/d", "a/commands/d/extra"));
        assert!(!topic_matches("a/commands/d/extra", "a/commands/d"));
    }
}
