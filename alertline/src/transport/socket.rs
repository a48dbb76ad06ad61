//! Per-socket task: open, heartbeat, read loop and fan-out.

use super::{
    ConnectionStatus, HEARTBEAT_PING, HEARTBEAT_PONG, Payload, Registry, TransportEvent,
};
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Upper bound on how long a closing socket may take to flush its close frame
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) struct SocketTask {
    pub(super) registry: Arc<Mutex<Registry>>,
    pub(super) url: String,
    pub(super) generation: u64,
    pub(super) heartbeat_interval: Duration,
}

impl SocketTask {
    pub(super) async fn run(
        self,
        outbound_rx: mpsc::UnboundedReceiver<Message>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let connected = tokio::select! {
            result = connect_async(self.url.as_str()) => result,
            _ = &mut shutdown_rx => {
                debug!(url = %self.url, "socket torn down before it opened");
                return;
            }
        };

        let ws_stream = match connected {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                error!("Failed to connect to {}: {}", self.url, e);
                self.set_status(ConnectionStatus::Error);
                self.broadcast(TransportEvent::Error(e.to_string()));
                self.finish();
                return;
            }
        };

        info!("Connected to push endpoint at {}", self.url);
        self.set_status(ConnectionStatus::Connected);
        self.broadcast(TransportEvent::Connected);

        let (write, mut read) = ws_stream.split();

        // Heartbeat and outbound frames share the write half
        let (writer_stop_tx, writer_stop_rx) = oneshot::channel();
        let mut writer = tokio::spawn(run_writer(
            write,
            outbound_rx,
            writer_stop_rx,
            self.heartbeat_interval,
        ));

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(url = %self.url, "closing socket on request");
                    break;
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == HEARTBEAT_PONG {
                            continue;
                        }
                        self.broadcast(TransportEvent::Message(Payload::parse(text.as_str())));
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) if text == HEARTBEAT_PONG => {}
                        Ok(text) => self.broadcast(TransportEvent::Message(Payload::parse(text))),
                        Err(_) => {
                            let len = bytes.len();
                            debug!(url = %self.url, len, "ignoring non-utf8 binary frame")
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(url = %self.url, ?frame, "Server closed connection");
                        self.set_status(ConnectionStatus::Disconnected);
                        break;
                    }
                    Some(Ok(_)) => {
                        // Protocol-level ping/pong - tungstenite handles these automatically
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error on {}: {}", self.url, e);
                        self.set_status(ConnectionStatus::Error);
                        self.broadcast(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        debug!(url = %self.url, "socket stream ended");
                        self.set_status(ConnectionStatus::Disconnected);
                        break;
                    }
                }
            }
        }

        // Stop heartbeat before the record disappears
        let _ = writer_stop_tx.send(());
        if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            warn!(url = %self.url, "socket writer did not stop in time, aborting");
            writer.abort();
        }

        self.finish();
    }

    fn set_status(&self, status: ConnectionStatus) {
        let mut registry = self.registry.lock();
        if let Some(record) = registry.connections.get_mut(&self.url) {
            if record.generation == self.generation {
                record.status = status;
            }
        }
    }

    /// Deliver `event` to a snapshot of the URL's subscribers. Events from a socket that has
    /// been replaced or torn down are dropped.
    fn broadcast(&self, event: TransportEvent) {
        let subscribers = {
            let registry = self.registry.lock();
            if !registry.is_current(&self.url, self.generation) {
                return;
            }
            registry.subscribers_of(&self.url)
        };

        deliver_all(&self.url, subscribers, event);
    }

    /// Remove this socket's record and tell subscribers it is gone. The subscriber set is kept
    /// so the same subscribers can reconnect.
    fn finish(&self) {
        let subscribers = {
            let mut registry = self.registry.lock();
            if !registry.is_current(&self.url, self.generation) {
                debug!(url = %self.url, generation = self.generation, "stale socket finished");
                return;
            }
            registry.connections.remove(&self.url);
            registry.subscribers_of(&self.url)
        };

        info!(url = %self.url, subscribers = subscribers.len(), "socket disconnected");
        deliver_all(&self.url, subscribers, TransportEvent::Disconnected);
    }
}

fn deliver_all(url: &str, subscribers: Vec<super::Subscriber>, event: TransportEvent) {
    for subscriber in subscribers {
        if !subscriber.deliver(event.clone()) {
            debug!(url, subscriber = %subscriber.id(), "subscriber receiver dropped, skipping");
        }
    }
}

/// Owns the write half: sends the keepalive on a fixed interval, forwards outbound frames,
/// and sends a close frame when told to stop.
async fn run_writer<S>(
    mut write: S,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut stop: oneshot::Receiver<()>,
    heartbeat_interval: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    let mut outbound_open = true;

    loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = write.send(Message::Text(HEARTBEAT_PING.into())).await {
                    debug!("Failed to send heartbeat, connection likely dead: {}", e);
                    break;
                }
            }
            message = outbound.recv(), if outbound_open => match message {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        debug!("Failed to send outbound frame: {}", e);
                        break;
                    }
                }
                None => outbound_open = false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionManager, HEARTBEAT_INTERVAL, Subscriber};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unusable_record_is_replaced_and_its_late_events_dropped() {
        struct TestCase {
            status: ConnectionStatus,
        }

        let tests = vec![
            TestCase {
                // TC0: read error
                status: ConnectionStatus::Error,
            },
            TestCase {
                // TC1: server close, writer still draining
                status: ConnectionStatus::Disconnected,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            // Accepts TCP but never answers the handshake, so sockets stay Connecting
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}/ws", listener.local_addr().unwrap());
            let manager = ConnectionManager::new();

            let (first, mut first_rx) = Subscriber::new();
            manager.connect(&url, &first);
            let stale = {
                let mut registry = manager.registry.lock();
                let record = registry.connections.get_mut(&url).unwrap();
                record.status = test.status;
                SocketTask {
                    registry: Arc::clone(&manager.registry),
                    url: url.clone(),
                    generation: record.generation,
                    heartbeat_interval: HEARTBEAT_INTERVAL,
                }
            };
            assert_eq!(manager.status(&url), test.status, "TC{} failed", index);

            let (second, mut second_rx) = Subscriber::new();
            manager.connect(&url, &second);
            assert_eq!(manager.connection_count(), 1, "TC{} failed", index);
            assert_eq!(manager.subscriber_count(&url), 2, "TC{} failed", index);
            assert_eq!(
                manager.status(&url),
                ConnectionStatus::Connecting,
                "TC{} failed",
                index
            );

            // The evicted socket's task winds down after the replacement is registered
            stale.set_status(ConnectionStatus::Error);
            stale.broadcast(TransportEvent::Error("late read error".to_string()));
            stale.finish();

            assert_eq!(manager.connection_count(), 1, "TC{} failed", index);
            assert_eq!(
                manager.status(&url),
                ConnectionStatus::Connecting,
                "TC{} failed",
                index
            );
            assert!(first_rx.try_recv().is_err(), "TC{} failed", index);
            assert!(second_rx.try_recv().is_err(), "TC{} failed", index);

            drop(listener);
        }
    }
}
