// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 远程视觉模型 (remote vision model)
//!
//! The request carries the JPEG as base64 plus a fixed instruction; the reply
//! is free text that should contain one JSON object.

use super::FusionError;
use crate::config::VisionConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub const INSTRUCTION: &str = "Analyze this image from an urban street scene. Identify all humans, \
vehicles (cars, bikes, etc.), animals, and other potential obstacles. For each object, provide its \
location in the image (top, bottom, left, right) and confidence score. Format the response as JSON \
only with the following structure: {\"objects\": [{\"type\": \"person\", \"confidence\": 0.95, \
\"box\": [x1, y1, x2, y2]}, ...]}";

/// One object reported by the model. Unknown fields are kept for the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionObject {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl VisionObject {
    pub fn new(kind: impl Into<String>, confidence: f64, bbox: Option<[f64; 4]>) -> Self {
        Self {
            kind: kind.into(),
            confidence,
            bbox,
            extra: serde_json::Map::new(),
        }
    }
}

pub trait VisionModel: Send + Sync {
    /// Raw text reply for one JPEG frame.
    fn analyze(&self, jpeg: &[u8]) -> Result<String, FusionError>;

    fn name(&self) -> &str;
}

/// Objects from the first `{` to the last `}` of `text`; empty on any failure.
pub fn parse_objects(text: &str) -> Vec<VisionObject> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        debug!("no json object in model reply");
        return Vec::new();
    };
    if end < start {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(&text[start..=end]) {
        Ok(v) => v,
        Err(e) => {
            debug!("model reply is not valid json: {e}");
            return Vec::new();
        }
    };
    let Some(objects) = value.get("objects").and_then(Value::as_array) else {
        return Vec::new();
    };
    objects
        .iter()
        .filter_map(|o| serde_json::from_value(o.clone()).ok())
        .collect()
}

/// Messages-API style HTTP client.
pub struct HttpVisionModel {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: String,
    api_version: String,
    max_tokens: u32,
}

impl HttpVisionModel {
    /// Reads the API key from the configured environment variable.
    pub fn from_config(cfg: &VisionConfig) -> Result<Self, FusionError> {
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| FusionError::Vision(format!("{} is not set", cfg.api_key_env)))?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build();
        Ok(Self {
            agent,
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key,
            api_version: cfg.api_version.clone(),
            max_tokens: cfg.max_tokens,
        })
    }

    pub fn request_body(&self, jpeg: &[u8]) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/jpeg",
                            "data": STANDARD.encode(jpeg),
                        }
                    },
                    { "type": "text", "text": INSTRUCTION }
                ]
            }]
        })
    }
}

/// Text of the first content block, `"{}"` when absent.
fn reply_text(body: &Value) -> String {
    body.get("content")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("{}")
        .to_string()
}

impl VisionModel for HttpVisionModel {
    fn analyze(&self, jpeg: &[u8]) -> Result<String, FusionError> {
        let response = self
            .agent
            .post(&self.endpoint)
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", &self.api_version)
            .set("content-type", "application/json")
            .send_json(self.request_body(jpeg))
            .map_err(|e| FusionError::Vision(e.to_string()))?;
        let body: Value = response
            .into_json()
            .map_err(|e| FusionError::Vision(format!("unreadable reply: {e}")))?;
        Ok(reply_text(&body))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerates_surrounding_prose() {
        let text = "detected a person {\"objects\":[{\"type\":\"person\",\"confidence\":0.92,\"box\":[1,2,3,4]}]} thanks";
        let objects = parse_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].kind, "person");
        assert_eq!(objects[0].confidence, 0.92);
        assert_eq!(objects[0].bbox, Some([1., 2., 3., 4.]));
    }

    #[test]
    fn unparseable_replies_are_empty() {
        assert!(parse_objects("no objects here").is_empty());
        assert!(parse_objects("} backwards {").is_empty());
        assert!(parse_objects("{\"objects\": [ broken").is_empty());
        assert!(parse_objects("{\"something\": 1}").is_empty());
    }

    #[test]
    fn keeps_unknown_fields_and_skips_bad_entries() {
        let text = r#"{"objects":[{"type":"dog","confidence":0.8,"color":"brown"},{"type":"cat","confidence":"high"}]}"#;
        let objects = parse_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].extra["color"], "brown");
        assert_eq!(objects[0].bbox, None);
    }

    #[test]
    fn reply_text_reads_first_block() {
        let body = json!({"content": [{"type": "text", "text": "{\"objects\": []}"}]});
        assert_eq!(reply_text(&body), "{\"objects\": []}");
        assert_eq!(reply_text(&json!({})), "{}");
    }

    #[test]
    fn request_carries_image_and_instruction() {
        let model = HttpVisionModel {
            agent: ureq::agent(),
            endpoint: "http://localhost".into(),
            model: "m".into(),
            api_key: "k".into(),
            api_version: "v".into(),
            max_tokens: 1000,
        };
        let body = model.request_body(&[0xff, 0xd8]);
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["source"]["data"], "/9g=");
        assert_eq!(content[1]["text"], INSTRUCTION);
        assert_eq!(body["max_tokens"], 1000);
    }
}
