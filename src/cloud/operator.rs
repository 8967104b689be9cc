// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 操作员指令 (operator command path)
//!
//! Request/response bodies of the operator console's `POST /commands`.

use crate::transport::{Topics, Transport};
use crate::types::{Command, CommandKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const ISSUER: &str = "operator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRequest {
    pub command: String,
    #[serde(default)]
    pub reason: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorResponse {
    pub success: bool,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperatorResponse {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            timestamp: crate::unix_now(),
            error: Some(error.into()),
        }
    }
}

fn validate(req: &OperatorRequest) -> Result<CommandKind, String> {
    if req.device_id.is_empty() || req.device_id.contains(['/', '+', '#']) {
        return Err(format!("invalid deviceId '{}'", req.device_id));
    }
    req.command.parse()
}

/// Validates, stamps and publishes to `P/commands/<deviceId>`.
pub fn send_command(transport: &dyn Transport, topic_prefix: &str, req: &OperatorRequest) -> OperatorResponse {
    let kind = match validate(req) {
        Ok(kind) => kind,
        Err(e) => {
            warn!("operator request rejected: {e}");
            return OperatorResponse::failed(e);
        }
    };
    let reason = if req.reason.is_empty() {
        format!("Manual {kind} from operator")
    } else {
        req.reason.clone()
    };
    let cmd = Command::new(kind, reason, ISSUER);
    let payload = match cmd.to_json() {
        Ok(p) => p,
        Err(e) => return OperatorResponse::failed(e.to_string()),
    };
    let topic = Topics::new(topic_prefix, req.device_id.clone()).commands();
    match transport.publish(&topic, payload) {
        Ok(()) => {
            info!(%topic, %kind, reason = %cmd.reason, "operator command sent");
            OperatorResponse {
                success: true,
                timestamp: cmd.timestamp,
                error: None,
            }
        }
        Err(e) => OperatorResponse::failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBus;

    fn req(command: &str, device: &str) -> OperatorRequest {
        OperatorRequest {
            command: command.into(),
            reason: String::new(),
            device_id: device.into(),
        }
    }

    #[test]
    fn publishes_to_device_topic() {
        let bus = LocalBus::new();
        let rx = bus.subscribe("adrve/commands/truck-7").unwrap();
        let resp = send_command(&bus, "adrve", &req("RESUME", "truck-7"));
        assert!(resp.success);
        assert!(resp.error.is_none());

        let cmd = Command::decode(&rx.try_recv().unwrap().payload, 0.0).unwrap();
        assert_eq!(cmd.kind, CommandKind::Resume);
        assert_eq!(cmd.issuer, ISSUER);
        assert_eq!(cmd.timestamp, resp.timestamp);
    }

    #[test]
    fn rejects_bad_requests_without_publishing() {
        let bus = LocalBus::new();
        let resp = send_command(&bus, "adrve", &req("reverse", "d"));
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("reverse"));
        assert!(!send_command(&bus, "adrve", &req("stop", "a/b")).success);
        assert_eq!(bus.published(), 0);
    }

    #[test]
    fn wire_shape() {
        let parsed: OperatorRequest =
            serde_json::from_str(r#"{"command":"stop","reason":"manual","deviceId":"adrve_edge"}"#).unwrap();
        assert_eq!(parsed.device_id, "adrve_edge");
        let resp = serde_json::to_value(OperatorResponse {
            success: true,
            timestamp: 5.0,
            error: None,
        })
        .unwrap();
        assert_eq!(resp, serde_json::json!({"success": true, "timestamp": 5.0}));
    }
}
