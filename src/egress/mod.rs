// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频外发进程监管 (Video egress supervisor)
///
/// 按顺序尝试各外发策略, 第一个存活的子进程胜出:
/// - NotStarted → Launching → Probing → Running
/// - 启动失败或探测期内退出 → Failed → 下一个策略
/// - 全部失败 → EgressError::Exhausted (启动致命)
///
/// 每次启动前重新解析凭证并写出凭证文件; stdout/stderr 由两个读线程排空.
pub mod credentials;
pub mod launcher;
pub mod strategy;

pub use credentials::{ChainCredentials, CredentialProvider, Credentials, EnvCredentials, StaticCredentials};
pub use launcher::{ChildProcess, LaunchSpec, ProcessLauncher, SystemLauncher};

use crate::config::{EgressConfig, SourceConfig, StrategyKind};
use crate::pipeline::join_with_timeout;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const PROBE_SLICE: Duration = Duration::from_millis(50);

static SEVERITY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\b(ERROR|WARN(?:ING)?)\b").ok());

/// Severity marker of a producer log line, if any.
fn severity(line: &str) -> Option<&str> {
    SEVERITY.as_ref()?.find(line).map(|m| m.as_str())
}

#[derive(Error, Debug)]
pub enum EgressError {
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("all {attempts} egress strategies failed")]
    Exhausted { attempts: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressState {
    NotStarted,
    Launching,
    Probing,
    Running,
    Failed,
}

/// One strategy tried by the supervisor.
#[derive(Debug, Clone)]
pub struct EgressAttempt {
    /// 1-based position in the strategy list.
    pub id: usize,
    pub strategy: StrategyKind,
    pub started_at: Instant,
    pub state: EgressState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub failure: Option<String>,
}

impl EgressAttempt {
    fn new(id: usize, strategy: StrategyKind) -> Self {
        Self {
            id,
            strategy,
            started_at: Instant::now(),
            state: EgressState::NotStarted,
            pid: None,
            exit_code: None,
            failure: None,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.state = EgressState::Failed;
        self.failure = Some(reason.into());
    }
}

pub struct EgressSupervisor {
    cfg: EgressConfig,
    source: SourceConfig,
    launcher: Arc<dyn ProcessLauncher>,
    credentials: Box<dyn CredentialProvider>,
    attempts: Vec<EgressAttempt>,
    child: Option<Box<dyn ChildProcess>>,
    readers: Vec<JoinHandle<()>>,
}

impl EgressSupervisor {
    pub fn new(
        cfg: EgressConfig,
        source: SourceConfig,
        launcher: Arc<dyn ProcessLauncher>,
        credentials: Box<dyn CredentialProvider>,
    ) -> Self {
        Self {
            cfg,
            source,
            launcher,
            credentials,
            attempts: Vec::new(),
            child: None,
            readers: Vec::new(),
        }
    }

    /// System launcher, environment-then-profile credentials.
    pub fn with_defaults(cfg: EgressConfig, source: SourceConfig) -> Self {
        let credentials = Box::new(ChainCredentials::default_chain(&cfg.aws_profile));
        Self::new(cfg, source, Arc::new(SystemLauncher), credentials)
    }

    pub fn attempts(&self) -> &[EgressAttempt] {
        &self.attempts
    }

    /// State of the latest attempt.
    pub fn state(&self) -> EgressState {
        self.attempts.last().map_or(EgressState::NotStarted, |a| a.state)
    }

    pub fn running(&self) -> Option<&EgressAttempt> {
        self.attempts.last().filter(|a| a.state == EgressState::Running)
    }

    /// Walks the strategy list until one child survives the probe window.
    pub fn start(&mut self) -> Result<&EgressAttempt, EgressError> {
        let strategies = self.cfg.strategies.clone();
        for (i, kind) in strategies.into_iter().enumerate() {
            let mut attempt = EgressAttempt::new(i + 1, kind);
            let creds = self.refresh_credentials()?;

            attempt.state = EgressState::Launching;
            let spec = match strategy::build(kind, &self.cfg, &self.source, &creds) {
                Ok(spec) => spec,
                Err(reason) => {
                    warn!(strategy = ?kind, "egress strategy skipped: {reason}");
                    attempt.fail(reason);
                    self.attempts.push(attempt);
                    continue;
                }
            };
            info!(id = attempt.id, strategy = ?kind, command = %spec.display(), "launching egress");

            let mut child = match self.launcher.launch(&spec) {
                Ok(child) => child,
                Err(e) => {
                    warn!(strategy = ?kind, "egress launch failed: {e}");
                    attempt.fail(e.to_string());
                    self.attempts.push(attempt);
                    continue;
                }
            };
            attempt.pid = Some(child.id());
            attempt.started_at = Instant::now();
            self.spawn_readers(child.as_mut(), kind);

            attempt.state = EgressState::Probing;
            match self.probe(child.as_mut()) {
                None => {
                    attempt.state = EgressState::Running;
                    info!(id = attempt.id, strategy = ?kind, pid = child.id(), "egress running");
                    self.child = Some(child);
                    self.attempts.push(attempt);
                    return Ok(&self.attempts[self.attempts.len() - 1]);
                }
                Some(code) => {
                    warn!(id = attempt.id, strategy = ?kind, code, "egress exited during probe");
                    attempt.exit_code = Some(code);
                    attempt.fail(format!("exited with code {code}"));
                    self.attempts.push(attempt);
                    self.join_readers();
                }
            }
        }
        error!(attempts = self.attempts.len(), "every egress strategy failed");
        Err(EgressError::Exhausted {
            attempts: self.attempts.len(),
        })
    }

    fn refresh_credentials(&self) -> Result<Credentials, EgressError> {
        let creds = self.credentials.resolve()?;
        let producer_dir = self.cfg.producer_path.join(".kvs");
        let written =
            credentials::write_credential_files(&creds, &[self.cfg.credential_dir.as_path(), producer_dir.as_path()])?;
        debug!(files = ?written, provider = %self.credentials.describe(), "credential files refreshed");
        Ok(creds)
    }

    /// `Some(exit code)` if the child dies inside the grace window.
    fn probe(&self, child: &mut dyn ChildProcess) -> Option<i32> {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.probe_grace_ms);
        loop {
            match child.try_wait() {
                Ok(Some(code)) => return Some(code),
                Ok(None) => {}
                Err(e) => {
                    warn!("egress status check failed: {e}");
                    return Some(-1);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(PROBE_SLICE.min(deadline - now));
        }
    }

    fn spawn_readers(&mut self, child: &mut dyn ChildProcess, kind: StrategyKind) {
        let pipes = [("out", child.take_stdout()), ("err", child.take_stderr())];
        for (name, pipe) in pipes {
            let Some(pipe) = pipe else { continue };
            let spawned = std::thread::Builder::new()
                .name(format!("edgeguard-egress-{name}"))
                .spawn(move || drain_output(pipe, kind, name));
            match spawned {
                Ok(handle) => self.readers.push(handle),
                Err(e) => warn!("egress {name} reader not started: {e}"),
            }
        }
    }

    fn join_readers(&mut self) {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.shutdown_timeout_ms);
        for handle in self.readers.drain(..) {
            if !join_with_timeout(handle, deadline) {
                warn!("egress reader did not finish in time");
            }
        }
    }

    /// Re-checks the running child. A dead child leaves the supervisor `Failed`.
    pub fn check(&mut self) -> EgressState {
        let Some(child) = self.child.as_mut() else {
            return self.state();
        };
        let exited = match child.try_wait() {
            Ok(Some(code)) => Some(code),
            Ok(None) => None,
            Err(_) => Some(-1),
        };
        if let Some(code) = exited {
            self.child = None;
            if let Some(attempt) = self.attempts.last_mut() {
                warn!(id = attempt.id, strategy = ?attempt.strategy, code, "egress exited");
                attempt.exit_code = Some(code);
                attempt.fail(format!("exited with code {code}"));
            }
        }
        self.state()
    }

    /// Terminates the child and joins the readers, each with a bounded wait.
    pub fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            if let Err(e) = child.kill() {
                warn!(pid, "egress kill failed: {e}");
            }
            let deadline = Instant::now() + Duration::from_millis(self.cfg.shutdown_timeout_ms);
            loop {
                match child.try_wait() {
                    Ok(Some(code)) => {
                        info!(pid, code, "egress stopped");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => std::thread::sleep(PROBE_SLICE),
                    _ => {
                        warn!(pid, "egress did not exit in time");
                        break;
                    }
                }
            }
        }
        self.join_readers();
    }
}

impl Drop for EgressSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain_output(pipe: Box<dyn Read + Send>, kind: StrategyKind, stream: &'static str) {
    for line in BufReader::new(pipe).lines() {
        let Ok(line) = line else { break };
        if let Some(level) = severity(&line) {
            if level == "ERROR" {
                error!(strategy = ?kind, stream, "{}", line.trim());
            } else {
                warn!(strategy = ?kind, stream, "{}", line.trim());
            }
        }
    }
}
