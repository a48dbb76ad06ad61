//! Shared WebSocket transport
//!
//! Owns at most one live socket per endpoint URL and fans every inbound frame out to all
//! subscribers registered for that URL. Sockets are reference-counted by subscriber: the
//! socket is torn down only when its last subscriber disconnects.
//!
//! The manager shares and fans out; it does not reconnect on its own. A subscriber that wants
//! to stay connected re-calls [`ConnectionManager::connect`] after it sees
//! [`TransportEvent::Disconnected`].

mod socket;

use derive_more::Display;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// Interval between outbound keepalive frames while a socket is open
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound keepalive frame
pub const HEARTBEAT_PING: &str = "ping";

/// Inbound keepalive acknowledgement, never handed to subscribers
pub const HEARTBEAT_PONG: &str = "pong";

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Keepalive interval
    pub heartbeat_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl TransportConfig {
    /// Set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Socket lifecycle status for one endpoint URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Inbound payload after keepalive filtering
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Frame parsed as structured JSON
    Json(serde_json::Value),
    /// Frame that is not valid JSON, passed through untouched
    Text(String),
}

impl Payload {
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(text.to_string()),
        }
    }
}

/// Event delivered to every subscriber of a URL
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    Message(Payload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("sub-{_0}")]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// One logical consumer of a shared connection.
///
/// Cloning keeps the same identity, so the same subscriber can be re-attached with
/// [`ConnectionManager::connect`] after a drop.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Subscriber {
    /// Create a subscriber and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Deliver an event; a dropped receiver only affects this subscriber.
    fn deliver(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Sender side of a shared connection, returned from [`ConnectionManager::connect`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    url: String,
    subscriber: SubscriberId,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    /// Queue a text frame on the socket this handle was issued for.
    ///
    /// Returns false when that socket has already closed.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let text: String = text.into();
        self.outbound.send(Message::Text(text.into())).is_ok()
    }

    /// Serialise `value` as JSON and queue it as a text frame
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<bool, serde_json::Error> {
        let text = serde_json::to_string(value)?;
        Ok(self.send_text(text))
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    generation: u64,
    status: ConnectionStatus,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ConnectionRecord {
    /// Ask the socket task to close; its heartbeat stops with it.
    fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    /// Live (non-closed) sockets, keyed by URL
    connections: HashMap<String, ConnectionRecord>,
    /// Subscriber sets, keyed by URL. Survives socket close.
    subscribers: HashMap<String, HashMap<SubscriberId, Subscriber>>,
    next_generation: u64,
}

impl Registry {
    fn is_current(&self, url: &str, generation: u64) -> bool {
        self.connections
            .get(url)
            .is_some_and(|record| record.generation == generation)
    }

    fn subscribers_of(&self, url: &str) -> Vec<Subscriber> {
        self.subscribers
            .get(url)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Owned, injectable connection service. Cheap to clone; clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    registry: Arc<Mutex<Registry>>,
    config: TransportConfig,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            config,
        }
    }

    /// Attach `subscriber` to the shared connection for `url`, opening a socket only when no
    /// usable one exists.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, url: &str, subscriber: &Subscriber) -> ConnectionHandle {
        let mut registry = self.registry.lock();

        registry
            .subscribers
            .entry(url.to_string())
            .or_default()
            .insert(subscriber.id(), subscriber.clone());

        let existing = registry
            .connections
            .get(url)
            .map(|record| (record.status, record.outbound.clone()));

        match existing {
            Some((ConnectionStatus::Connecting, outbound)) => {
                debug!(url, subscriber = %subscriber.id(), "attaching to opening socket");
                return self.handle(url, subscriber, outbound);
            }
            Some((ConnectionStatus::Connected, outbound)) => {
                debug!(url, subscriber = %subscriber.id(), "attaching to open socket");
                subscriber.deliver(TransportEvent::Connected);
                return self.handle(url, subscriber, outbound);
            }
            Some((ConnectionStatus::Disconnected | ConnectionStatus::Error, _)) => {
                if let Some(stale) = registry.connections.remove(url) {
                    debug!(url, status = %stale.status, "evicting unusable socket");
                    stale.close();
                }
            }
            None => {}
        }

        let generation = registry.next_generation;
        registry.next_generation += 1;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        registry.connections.insert(
            url.to_string(),
            ConnectionRecord {
                generation,
                status: ConnectionStatus::Connecting,
                outbound: outbound_tx.clone(),
                shutdown: Some(shutdown_tx),
            },
        );
        drop(registry);

        info!(url, generation, "opening socket");
        let task = socket::SocketTask {
            registry: Arc::clone(&self.registry),
            url: url.to_string(),
            generation,
            heartbeat_interval: self.config.heartbeat_interval,
        };
        tokio::spawn(task.run(outbound_rx, shutdown_rx));

        self.handle(url, subscriber, outbound_tx)
    }

    /// Detach a subscriber. The socket is closed only when no subscribers remain for `url`.
    pub fn disconnect(&self, url: &str, subscriber: SubscriberId) {
        let mut registry = self.registry.lock();

        let remaining = match registry.subscribers.get_mut(url) {
            Some(set) => {
                set.remove(&subscriber);
                set.len()
            }
            None => 0,
        };

        if remaining > 0 {
            debug!(url, %subscriber, remaining, "subscriber detached, socket kept open");
            return;
        }

        registry.subscribers.remove(url);
        if let Some(record) = registry.connections.remove(url) {
            info!(url, "last subscriber detached, closing socket");
            record.close();
        }
    }

    /// Current status of the socket for `url`
    pub fn status(&self, url: &str) -> ConnectionStatus {
        self.registry
            .lock()
            .connections
            .get(url)
            .map(|record| record.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Number of live (non-closed) sockets across all URLs
    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }

    /// Number of subscribers registered for `url`
    pub fn subscriber_count(&self, url: &str) -> usize {
        self.registry
            .lock()
            .subscribers
            .get(url)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn handle(
        &self,
        url: &str,
        subscriber: &Subscriber,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> ConnectionHandle {
        ConnectionHandle {
            url: url.to_string(),
            subscriber: subscriber.id(),
            outbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_parse() {
        assert_eq!(
            Payload::parse(r#"{"id":"n1"}"#),
            Payload::Json(json!({"id": "n1"}))
        );
        assert_eq!(
            Payload::parse("service restarting"),
            Payload::Text("service restarting".to_string())
        );
    }

    #[test]
    fn test_config_builder() {
        let config = TransportConfig::default().with_heartbeat_interval(Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(TransportConfig::default().heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_subscriber_ids_are_unique() {
        let (first, _first_rx) = Subscriber::new();
        let (second, _second_rx) = Subscriber::new();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.clone().id(), first.id());
    }

    #[test]
    fn test_status_defaults_to_disconnected() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.status("ws://127.0.0.1:1/ws"), ConnectionStatus::Disconnected);
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_socket_for_remaining_subscribers() {
        let manager = ConnectionManager::new();
        let url = "ws://127.0.0.1:1/never-opens";
        let (first, _first_rx) = Subscriber::new();
        let (second, _second_rx) = Subscriber::new();

        manager.connect(url, &first);
        manager.connect(url, &second);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.subscriber_count(url), 2);

        manager.disconnect(url, first.id());
        assert_eq!(manager.subscriber_count(url), 1);
        assert_eq!(manager.connection_count(), 1);

        manager.disconnect(url, second.id());
        assert_eq!(manager.subscriber_count(url), 0);
        assert_eq!(manager.connection_count(), 0);
    }
}
