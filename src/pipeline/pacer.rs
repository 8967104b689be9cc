// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Monotonic-clock rate limiter for the inference and publish stages.

use super::Shutdown;
use std::time::{Duration, Instant};

/// Longest single sleep, so cancellation is observed promptly.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left before the next run is due.
    pub fn remaining(&self) -> Duration {
        match self.last {
            Some(last) => self.interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub fn ready(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Starts a new period at the current instant.
    pub fn mark(&mut self) {
        self.last = Some(Instant::now());
    }

    /// Waits in slices until the period has elapsed. `false` means cancelled.
    pub fn wait(&self, shutdown: &Shutdown) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            let remaining = self.remaining();
            if remaining.is_zero() {
                return true;
            }
            if shutdown.wait_timeout(remaining.min(WAIT_SLICE)) {
                return false;
            }
        }
    }
}
