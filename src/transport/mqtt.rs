// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! MQTT 传输 (rumqttc 同步客户端)
//!
//! One event-loop thread owns the connection. It dispatches inbound
//! publications, resubscribes on every ConnAck and backs off exponentially
//! between reconnect attempts. Outgoing publishes queue in the client's
//! request channel while offline.

use super::{topic_matches, Message, Transport, TransportError};
use crate::config::TransportConfig;
use crate::pipeline::Shutdown;
use crossbeam_channel::{bounded, Sender, TrySendError};
use rand::Rng;
use rumqttc::{
    Client, Connection, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport as Wire,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const SUBSCRIBER_CAPACITY: usize = 64;

/// Bounded exponential backoff with ±10% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            next: min,
        }
    }

    /// Un-jittered delay the next call will be based on.
    pub fn peek(&self) -> Duration {
        self.next
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.max);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        base.mul_f64(jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}

type Subscribers = Arc<Mutex<Vec<(String, Sender<Message>)>>>;

pub struct MqttTransport {
    client: Client,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    stop: Shutdown,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|source| TransportError::Tls {
        path: path.to_path_buf(),
        source,
    })
}

impl MqttTransport {
    pub fn connect(cfg: &TransportConfig, client_id: &str) -> Result<Self, TransportError> {
        let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if cfg.tls {
            let ca = read_pem(&cfg.ca_path)?;
            let client_auth = Some((read_pem(&cfg.cert_path)?, read_pem(&cfg.key_path)?));
            // AWS IoT serves MQTT on 443 only with this ALPN protocol
            let alpn = (cfg.port == 443).then(|| vec![b"x-amzn-mqtt-ca".to_vec()]);
            options.set_transport(Wire::Tls(TlsConfiguration::Simple {
                ca,
                alpn,
                client_auth,
            }));
        }

        let (client, connection) = Client::new(options, cfg.request_capacity.max(1));
        let subscribers: Subscribers = Arc::default();
        let connected = Arc::new(AtomicBool::new(false));
        let stop = Shutdown::new();
        let (ack_tx, ack_rx) = bounded::<()>(1);

        let backoff = Backoff::new(
            Duration::from_millis(cfg.reconnect_min_ms),
            Duration::from_millis(cfg.reconnect_max_ms),
        );
        let handle = {
            let client = client.clone();
            let subscribers = subscribers.clone();
            let connected = connected.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("edgeguard-mqtt".into())
                .spawn(move || {
                    event_loop(connection, client, subscribers, connected, stop, backoff, ack_tx)
                })
                .map_err(|_| TransportError::Disconnected)?
        };

        let transport = Self {
            client,
            subscribers,
            connected,
            stop,
            event_loop: Mutex::new(Some(handle)),
        };

        let secs = cfg.connect_timeout_secs.max(1);
        if ack_rx.recv_timeout(Duration::from_secs(secs)).is_err() {
            transport.disconnect();
            return Err(TransportError::ConnectTimeout {
                host: cfg.host.clone(),
                port: cfg.port,
                secs,
            });
        }
        info!(host = %cfg.host, port = cfg.port, client_id, "mqtt connected");
        Ok(transport)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn dispatch(subscribers: &Subscribers, topic: &str, payload: &[u8]) {
    let mut subs = match subscribers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    subs.retain(|(filter, tx)| {
        if !topic_matches(filter, topic) {
            return true;
        }
        let msg = Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%topic, "subscriber backlog full, message dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    });
}

fn event_loop(
    mut connection: Connection,
    client: Client,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    stop: Shutdown,
    mut backoff: Backoff,
    ack_tx: Sender<()>,
) {
    for notification in connection.iter() {
        if stop.is_cancelled() {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                backoff.reset();
                let filters: Vec<String> = match subscribers.lock() {
                    Ok(subs) => subs.iter().map(|(f, _)| f.clone()).collect(),
                    Err(poisoned) => poisoned.into_inner().iter().map(|(f, _)| f.clone()).collect(),
                };
                for filter in filters {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        warn!(%filter, "resubscribe failed: {e}");
                    }
                }
                let _ = ack_tx.try_send(());
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                debug!(topic = %p.topic, bytes = p.payload.len(), "mqtt message");
                dispatch(&subscribers, &p.topic, &p.payload);
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if stop.is_cancelled() {
                    break;
                }
                let delay = backoff.next_delay();
                warn!("mqtt connection error: {e}; reconnecting in {:.1}s", delay.as_secs_f64());
                if stop.wait_timeout(delay) {
                    break;
                }
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    debug!("mqtt event loop exited");
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.stop.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, filter: &str) -> Result<crossbeam_channel::Receiver<Message>, TransportError> {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        {
            let mut subs = match self.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subs.push((filter.to_string(), tx));
        }
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;
        Ok(rx)
    }

    fn disconnect(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel();
        if let Err(e) = self.client.try_disconnect() {
            debug!("mqtt disconnect request failed: {e}");
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
        let handle = match self.event_loop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            // the loop may sit inside a network read; give it a moment, then move on
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        info!("mqtt disconnected");
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(32));
        let mut bases = Vec::new();
        for _ in 0..8 {
            bases.push(b.peek().as_secs());
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(32));
        }
        assert_eq!(bases, vec![1, 2, 4, 8, 16, 32, 32, 32]);
        b.reset();
        assert_eq!(b.peek(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let mut b = Backoff::new(Duration::from_secs(4), Duration::from_secs(32));
        let d = b.next_delay();
        assert!(d >= Duration::from_millis(3600) && d <= Duration::from_millis(4400));
    }

    #[test]
    fn missing_tls_material_fails_fast() {
        let cfg = TransportConfig {
            ca_path: "/nonexistent/ca.pem".into(),
            ..TransportConfig::default()
        };
        assert!(matches!(
            MqttTransport::connect(&cfg, "test"),
            Err(TransportError::Tls { .. })
        ));
    }
}
