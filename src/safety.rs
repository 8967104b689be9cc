// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 安全状态与指令监听 (Safety state and command listener)
///
/// - SafetyWriter: 唯一写者, 按时间戳单调应用指令
/// - SafetyHandle: 多读者, 读取快照 / 订阅状态变化
/// - CommandListener: 订阅指令主题 → 解码 → 应用
use crate::pipeline::Shutdown;
use crate::transport::{Message, Transport, TransportError};
use crate::types::{Command, Mode};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SafetyState {
    pub mode: Mode,
    pub last_command: Option<Command>,
    /// `None` until the first command is applied.
    pub last_applied: Option<f64>,
}

impl SafetyState {
    pub fn is_stopped(&self) -> bool {
        self.mode == Mode::Stopped
    }

    /// Whether `cmd` would overwrite this state.
    pub fn accepts(&self, cmd: &Command) -> bool {
        match self.last_applied {
            Some(ts) => cmd.timestamp > ts,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { from: Mode, to: Mode },
    /// Timestamp not newer than the applied one.
    Stale,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    stale: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Default)]
struct Shared {
    state: RwLock<SafetyState>,
    watchers: Mutex<Vec<Sender<SafetyState>>>,
    counters: Counters,
}

/// Creates the single writer and a reader handle over a fresh `running` state.
pub fn safety_state() -> (SafetyWriter, SafetyHandle) {
    let shared = Arc::new(Shared::default());
    (
        SafetyWriter {
            shared: shared.clone(),
        },
        SafetyHandle { shared },
    )
}

/// The only path that mutates [`SafetyState`]; one per state, not `Clone`.
pub struct SafetyWriter {
    shared: Arc<Shared>,
}

impl SafetyWriter {
    pub fn handle(&self) -> SafetyHandle {
        SafetyHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn apply(&mut self, cmd: Command) -> ApplyOutcome {
        let (from, next) = {
            let mut state = match self.shared.state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !state.accepts(&cmd) {
                self.shared.counters.stale.fetch_add(1, Ordering::Relaxed);
                return ApplyOutcome::Stale;
            }
            let from = state.mode;
            *state = SafetyState {
                mode: cmd.kind.target_mode(),
                last_applied: Some(cmd.timestamp),
                last_command: Some(cmd),
            };
            (from, state.clone())
        };
        self.shared.counters.applied.fetch_add(1, Ordering::Relaxed);
        self.notify(&next);
        ApplyOutcome::Applied { from, to: next.mode }
    }

    pub fn record_malformed(&self) {
        self.shared.counters.malformed.fetch_add(1, Ordering::Relaxed);
    }

    fn notify(&self, state: &SafetyState) {
        let mut watchers = match self.shared.watchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watchers.retain(|tx| !matches!(tx.try_send(state.clone()), Err(TrySendError::Disconnected(_))));
    }
}

/// Cloneable read side. Every read is a copy.
#[derive(Clone)]
pub struct SafetyHandle {
    shared: Arc<Shared>,
}

impl SafetyHandle {
    pub fn snapshot(&self) -> SafetyState {
        match self.shared.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.snapshot().mode
    }

    pub fn is_stopped(&self) -> bool {
        self.mode() == Mode::Stopped
    }

    /// Applied transitions from now on. A slow watcher misses intermediate states.
    pub fn watch(&self) -> Receiver<SafetyState> {
        let (tx, rx) = bounded(16);
        let mut watchers = match self.shared.watchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watchers.push(tx);
        rx
    }

    pub fn applied_count(&self) -> u64 {
        self.shared.counters.applied.load(Ordering::Relaxed)
    }

    pub fn stale_count(&self) -> u64 {
        self.shared.counters.stale.load(Ordering::Relaxed)
    }

    pub fn malformed_count(&self) -> u64 {
        self.shared.counters.malformed.load(Ordering::Relaxed)
    }
}

// ========== 指令监听 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Subscribed,
    Applying,
}

/// 指令监听线程 (command listener)
pub struct CommandListener {
    topic: String,
    writer: SafetyWriter,
    state: ListenerState,
}

impl CommandListener {
    pub fn new(topic: impl Into<String>, writer: SafetyWriter) -> Self {
        Self {
            topic: topic.into(),
            writer,
            state: ListenerState::Idle,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Idle → Subscribed.
    pub fn subscribe(&mut self, transport: &dyn Transport) -> Result<Receiver<Message>, TransportError> {
        let rx = transport.subscribe(&self.topic)?;
        self.state = ListenerState::Subscribed;
        info!(topic = %self.topic, "subscribed to commands");
        Ok(rx)
    }

    /// Subscribed → Applying → Subscribed. `None` for undecodable payloads.
    pub fn handle(&mut self, payload: &[u8]) -> Option<ApplyOutcome> {
        self.state = ListenerState::Applying;
        let outcome = match Command::decode(payload, crate::unix_now()) {
            Ok(cmd) => {
                let kind = cmd.kind;
                let reason = cmd.reason.clone();
                let ts = cmd.timestamp;
                let outcome = self.writer.apply(cmd);
                match outcome {
                    ApplyOutcome::Applied { from, to } => {
                        if to == Mode::Stopped {
                            warn!(%kind, %reason, timestamp = ts, ?from, "safety stop applied");
                        } else {
                            info!(%kind, %reason, timestamp = ts, ?from, "safety command applied");
                        }
                    }
                    ApplyOutcome::Stale => debug!(%kind, timestamp = ts, "stale command ignored"),
                }
                Some(outcome)
            }
            Err(e) => {
                self.writer.record_malformed();
                warn!("dropping malformed command: {e}");
                None
            }
        };
        self.state = ListenerState::Subscribed;
        outcome
    }

    /// Applies commands until shutdown or until the subscription closes.
    pub fn run(mut self, rx: Receiver<Message>, shutdown: Shutdown) {
        info!("command listener started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            select! {
                recv(rx) -> msg => match msg {
                    Ok(msg) => {
                        self.handle(&msg.payload);
                    }
                    Err(_) => {
                        warn!("command subscription closed");
                        break;
                    }
                },
                recv(shutdown.receiver()) -> _ => break,
            }
        }
        self.state = ListenerState::Idle;
        info!("command listener stopped");
    }
}
