// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 停车策略 (stop policy)

use super::vision::VisionObject;
use crate::config::PolicyConfig;
use crate::types::{Command, CommandKind};
use std::collections::HashSet;

pub const ISSUER: &str = "fusion";

#[derive(Debug, Clone)]
pub struct StopPolicy {
    critical: HashSet<String>,
    threshold: f64,
}

impl StopPolicy {
    pub fn new(critical: impl IntoIterator<Item = impl AsRef<str>>, threshold: f64) -> Self {
        Self {
            critical: critical.into_iter().map(|t| t.as_ref().to_lowercase()).collect(),
            threshold,
        }
    }

    pub fn from_config(cfg: &PolicyConfig) -> Self {
        Self::new(&cfg.critical_types, cfg.critical_confidence)
    }

    pub fn is_critical(&self, kind: &str) -> bool {
        self.critical.contains(&kind.to_lowercase())
    }

    /// One lower-cased entry per critical object with confidence strictly above
    /// the threshold, in report order. Repeated types are listed each time.
    pub fn critical_types(&self, objects: &[VisionObject]) -> Vec<String> {
        objects
            .iter()
            .filter(|obj| obj.confidence > self.threshold)
            .map(|obj| obj.kind.to_lowercase())
            .filter(|kind| self.critical.contains(kind))
            .collect()
    }

    /// A `stop` stamped now, or `None` when nothing critical was seen.
    pub fn evaluate(&self, objects: &[VisionObject]) -> Option<Command> {
        let found = self.critical_types(objects);
        if found.is_empty() {
            return None;
        }
        let reason = format!("Critical objects detected: {}", found.join(", "));
        Some(Command::new(CommandKind::Stop, reason, ISSUER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(kind: &str, confidence: f64) -> VisionObject {
        VisionObject::new(kind, confidence, None)
    }

    #[test]
    fn threshold_is_strict() {
        let policy = StopPolicy::from_config(&PolicyConfig::default());
        assert!(policy.evaluate(&[obj("person", 0.7)]).is_none());
        assert!(policy.evaluate(&[obj("person", 0.7001)]).is_some());
    }

    #[test]
    fn matches_case_insensitively_and_lists_types() {
        let policy = StopPolicy::from_config(&PolicyConfig::default());
        let cmd = policy
            .evaluate(&[obj("Person", 0.9), obj("car", 0.99), obj("DOG", 0.8), obj("person", 0.95)])
            .unwrap();
        assert_eq!(cmd.kind, CommandKind::Stop);
        assert_eq!(cmd.reason, "Critical objects detected: person, dog, person");
        assert_eq!(cmd.issuer, ISSUER);
    }

    #[test]
    fn low_confidence_repeats_are_not_listed() {
        let policy = StopPolicy::from_config(&PolicyConfig::default());
        let found = policy.critical_types(&[obj("cat", 0.9), obj("cat", 0.5), obj("Cat", 0.71)]);
        assert_eq!(found, vec!["cat", "cat"]);
    }

    #[test]
    fn non_critical_objects_never_stop() {
        let policy = StopPolicy::from_config(&PolicyConfig::default());
        assert!(policy.evaluate(&[obj("car", 0.99), obj("bicycle", 0.95)]).is_none());
        assert!(policy.evaluate(&[]).is_none());
    }
}
