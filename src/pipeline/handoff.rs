// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 有界交接通道 (bounded stage handoff)
///
/// 两种策略 / two policies:
/// - Queue:  容量 N, 满则丢弃新数据 (drop newest, FIFO)
/// - Latest: 单槽, 新数据覆盖旧数据 (single slot, overwrite)
///
/// `offer` never blocks the producer. Single consumer by contract.
use super::Shutdown;
use crate::config::Sharing;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::time::Duration;

/// Outcome of a non-blocking [`Handoff::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Queue full; the offered item was discarded.
    Dropped,
    /// Latest-value slot; the previous unconsumed item was discarded.
    Replaced,
}

pub struct Handoff<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    mode: Sharing,
}

impl<T> Clone for Handoff<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            mode: self.mode,
        }
    }
}

impl<T> Handoff<T> {
    pub fn new(mode: Sharing, capacity: usize) -> Self {
        let capacity = match mode {
            Sharing::Queue => capacity.max(1),
            Sharing::Latest => 1,
        };
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, mode }
    }

    pub fn queue(capacity: usize) -> Self {
        Self::new(Sharing::Queue, capacity)
    }

    pub fn latest() -> Self {
        Self::new(Sharing::Latest, 1)
    }

    pub fn mode(&self) -> Sharing {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(1)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn offer(&self, item: T) -> Offer {
        match self.mode {
            Sharing::Queue => match self.tx.try_send(item) {
                Ok(()) => Offer::Accepted,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => Offer::Dropped,
            },
            Sharing::Latest => {
                let mut item = item;
                let mut replaced = false;
                loop {
                    match self.tx.try_send(item) {
                        Ok(()) => {
                            return if replaced {
                                Offer::Replaced
                            } else {
                                Offer::Accepted
                            };
                        }
                        Err(TrySendError::Full(back)) => {
                            item = back;
                            if self.rx.try_recv().is_ok() {
                                replaced = true;
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return Offer::Dropped,
                    }
                }
            }
        }
    }

    /// Blocks for the oldest item; `None` once `shutdown` fires.
    pub fn take(&self, shutdown: &Shutdown) -> Option<T> {
        if shutdown.is_cancelled() {
            return None;
        }
        select! {
            recv(self.rx) -> item => item.ok(),
            recv(shutdown.receiver()) -> _ => None,
        }
    }

    pub fn take_timeout(&self, shutdown: &Shutdown, timeout: Duration) -> Option<T> {
        if shutdown.is_cancelled() {
            return None;
        }
        select! {
            recv(self.rx) -> item => item.ok(),
            recv(shutdown.receiver()) -> _ => None,
            default(timeout) => None,
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn queue_never_exceeds_capacity_and_keeps_order() {
        let h = Handoff::queue(3);
        let mut accepted = Vec::new();
        for i in 0..10 {
            match h.offer(i) {
                Offer::Accepted => accepted.push(i),
                Offer::Dropped => {}
                Offer::Replaced => unreachable!(),
            }
            assert!(h.len() <= 3);
            if i % 4 == 3 {
                let taken = h.try_take().unwrap();
                assert_eq!(taken, accepted.remove(0));
            }
        }
        let rest = h.drain();
        assert_eq!(rest, accepted);
    }

    #[test]
    fn full_queue_drops_newest() {
        let h = Handoff::queue(2);
        assert_eq!(h.offer("a"), Offer::Accepted);
        assert_eq!(h.offer("b"), Offer::Accepted);
        assert_eq!(h.offer("c"), Offer::Dropped);
        assert_eq!(h.try_take(), Some("a"));
        assert_eq!(h.try_take(), Some("b"));
        assert_eq!(h.try_take(), None);
    }

    #[test]
    fn latest_slot_overwrites() {
        let h = Handoff::latest();
        assert_eq!(h.capacity(), 1);
        assert_eq!(h.offer(1), Offer::Accepted);
        assert_eq!(h.offer(2), Offer::Replaced);
        assert_eq!(h.offer(3), Offer::Replaced);
        assert_eq!(h.len(), 1);
        assert_eq!(h.try_take(), Some(3));
    }

    #[test]
    fn take_returns_none_on_shutdown() {
        let h: Handoff<u32> = Handoff::queue(1);
        let shutdown = Shutdown::new();
        let s = shutdown.clone();
        let consumer = h.clone();
        let t = std::thread::spawn(move || consumer.take(&s));
        std::thread::sleep(Duration::from_millis(20));
        shutdown.cancel();
        assert_eq!(t.join().unwrap(), None);
    }

    #[test]
    fn take_blocks_until_offer() {
        let h = Handoff::queue(4);
        let producer = h.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.offer(7u32)
        });
        let start = Instant::now();
        assert_eq!(h.take(&Shutdown::new()), Some(7));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(t.join().unwrap(), Offer::Accepted);
    }

    #[test]
    fn take_timeout_expires() {
        let h: Handoff<u8> = Handoff::queue(1);
        assert_eq!(h.take_timeout(&Shutdown::new(), Duration::from_millis(5)), None);
    }
}
