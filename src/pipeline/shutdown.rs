// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 协作式停止信号 (cooperative stop signal)
//!
//! Polled at every loop boundary and also selectable: cancelling drops the
//! shared sender so every blocked `recv` on [`Shutdown::receiver`] wakes at once.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let mut tx = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tx.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Disconnects when cancelled; never carries a message.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Sleeps up to `timeout`, returning `true` as soon as the signal fires.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }
}

impl Shutdown {
    /// Cancels on Ctrl+C or SIGTERM. A process may install only one handler.
    pub fn cancel_on_interrupt(&self) -> Result<(), ctrlc::Error> {
        let shutdown = self.clone();
        ctrlc::set_handler(move || {
            info!("🛑 interrupt received, stopping gracefully");
            shutdown.cancel();
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn cancel_wakes_waiters_early() {
        let shutdown = Shutdown::new();
        let s = shutdown.clone();
        let t = std::thread::spawn(move || {
            let start = Instant::now();
            assert!(s.wait_timeout(Duration::from_secs(10)));
            start.elapsed()
        });
        std::thread::sleep(Duration::from_millis(30));
        shutdown.cancel();
        assert!(t.join().unwrap() < Duration::from_secs(2));
        assert!(shutdown.is_cancelled());
    }

    #[test]
    fn uncancelled_wait_times_out() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(5)));
    }
}
