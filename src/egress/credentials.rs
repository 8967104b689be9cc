// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 凭证解析与写出 (credential resolution for the video producer)
//!
//! Credentials are re-resolved before every launch and written both to the
//! local credential file and to the producer's own `.kvs/credential`.

use super::EgressError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Producer credential file shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "accessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "secretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "sessionToken", default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl Credentials {
    /// Child environment variables carrying these credentials.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("AWS_ACCESS_KEY_ID".to_string(), self.access_key_id.clone()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), self.secret_access_key.clone()),
        ];
        if let Some(token) = &self.session_token {
            env.push(("AWS_SESSION_TOKEN".to_string(), token.clone()));
        }
        env
    }
}

pub trait CredentialProvider: Send + Sync {
    fn resolve(&self) -> Result<Credentials, EgressError>;

    fn describe(&self) -> String;
}

/// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / optional `AWS_SESSION_TOKEN`.
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn resolve(&self) -> Result<Credentials, EgressError> {
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        match (get("AWS_ACCESS_KEY_ID"), get("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(Credentials {
                access_key_id,
                secret_access_key,
                session_token: get("AWS_SESSION_TOKEN"),
            }),
            _ => Err(EgressError::Credentials("AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY not set".into())),
        }
    }

    fn describe(&self) -> String {
        "environment".to_string()
    }
}

/// A named profile from the shared credentials file (`~/.aws/credentials` by default).
pub struct ProfileCredentials {
    pub profile: String,
    pub path: PathBuf,
}

impl ProfileCredentials {
    pub fn new(profile: impl Into<String>) -> Self {
        let path = std::env::var_os("AWS_SHARED_CREDENTIALS_FILE")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".aws").join("credentials")))
            .unwrap_or_else(|| PathBuf::from(".aws/credentials"));
        Self {
            profile: profile.into(),
            path,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }
}

/// Minimal INI reader: `[section]` headers and `key = value` lines.
fn profile_entries(text: &str, profile: &str) -> Vec<(String, String)> {
    let mut current = None::<String>;
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim().to_string());
            continue;
        }
        if current.as_deref() != Some(profile) {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            out.push((k.trim().to_ascii_lowercase(), v.trim().to_string()));
        }
    }
    out
}

impl CredentialProvider for ProfileCredentials {
    fn resolve(&self) -> Result<Credentials, EgressError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| EgressError::Credentials(format!("{}: {e}", self.path.display())))?;
        let entries = profile_entries(&text, &self.profile);
        let find = |key: &str| {
            entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_empty())
        };
        match (find("aws_access_key_id"), find("aws_secret_access_key")) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(Credentials {
                access_key_id,
                secret_access_key,
                session_token: find("aws_session_token"),
            }),
            _ => Err(EgressError::Credentials(format!(
                "profile [{}] not found or incomplete in {}",
                self.profile,
                self.path.display()
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("profile {}", self.profile)
    }
}

/// Tries each provider in order; the first success wins.
pub struct ChainCredentials(pub Vec<Box<dyn CredentialProvider>>);

impl ChainCredentials {
    /// Environment first, then the configured profile.
    pub fn default_chain(profile: &str) -> Self {
        ChainCredentials(vec![Box::new(EnvCredentials), Box::new(ProfileCredentials::new(profile))])
    }
}

impl CredentialProvider for ChainCredentials {
    fn resolve(&self) -> Result<Credentials, EgressError> {
        let mut reasons = Vec::new();
        for provider in &self.0 {
            match provider.resolve() {
                Ok(creds) => {
                    debug!(provider = %provider.describe(), "credentials resolved");
                    return Ok(creds);
                }
                Err(e) => reasons.push(format!("{}: {e}", provider.describe())),
            }
        }
        Err(EgressError::Credentials(reasons.join("; ")))
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self.0.iter().map(|p| p.describe()).collect();
        format!("chain[{}]", names.join(", "))
    }
}

/// Fixed credentials, for tests and for callers that resolve elsewhere.
pub struct StaticCredentials(pub Credentials);

impl CredentialProvider for StaticCredentials {
    fn resolve(&self) -> Result<Credentials, EgressError> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Writes `credential` into every directory in `dirs`, creating them as needed.
pub fn write_credential_files(creds: &Credentials, dirs: &[&Path]) -> Result<Vec<PathBuf>, EgressError> {
    let json = serde_json::to_vec(creds).map_err(|e| EgressError::Credentials(e.to_string()))?;
    let mut written = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let io_err = |e: std::io::Error| EgressError::Credentials(format!("{}: {e}", dir.display()));
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let path = dir.join("credential");
        std::fs::write(&path, &json).map_err(io_err)?;
        written.push(path);
    }
    Ok(written)
}
