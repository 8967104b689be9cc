// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 进程内消息总线 (in-process bus)
//!
//! Topic-keyed post/subscribe. Slow subscribers lose messages instead of
//! stalling the publisher.

use super::{topic_matches, Message, Transport, TransportError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    subscribers: Mutex<Vec<(String, Sender<Message>)>>,
    published: AtomicUsize,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `publish` calls so far.
    pub fn published(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }
}

impl Transport for LocalBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let mut subs = match self.inner.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|(filter, tx)| {
            if !topic_matches(filter, topic) {
                return true;
            }
            let msg = Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match tx.try_send(msg) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!(%topic, "local subscriber full, message dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<Receiver<Message>, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        let mut subs = match self.inner.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.push((filter.to_string(), tx));
        Ok(rx)
    }

    fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_to_matching_subscribers_only() {
        let bus = LocalBus::new();
        let cmds = bus.subscribe("p/commands/d").unwrap();
        let all = bus.subscribe("p/#").unwrap();
        bus.publish("p/status/d/detection", b"x".to_vec()).unwrap();
        bus.publish("p/commands/d", b"y".to_vec()).unwrap();

        assert_eq!(cmds.try_recv().unwrap().payload, b"y");
        assert!(cmds.try_recv().is_err());
        assert_eq!(all.try_iter().count(), 2);
        assert_eq!(bus.published(), 2);
    }

    #[test]
    fn disconnect_closes_subscriptions() {
        let bus = LocalBus::new();
        let rx = bus.subscribe("t").unwrap();
        bus.disconnect();
        assert!(rx.recv().is_err());
        assert!(matches!(bus.publish("t", vec![]), Err(TransportError::Disconnected)));
    }
}
