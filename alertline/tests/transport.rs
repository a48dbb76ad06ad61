//! Socket-level behaviour of the shared connection manager against an in-process server.

use alertline::{
    ConnectionManager, ConnectionStatus, Payload, Subscriber, TransportConfig, TransportEvent,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    time::timeout,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
enum Step {
    Send(String),
    Close,
}

struct TestServer {
    url: String,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    inbound: mpsc::UnboundedReceiver<String>,
    steps: broadcast::Sender<Step>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/notifications", listener.local_addr().unwrap());

        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (steps, _) = broadcast::channel(64);

        {
            let accepted = Arc::clone(&accepted);
            let closed = Arc::clone(&closed);
            let steps = steps.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(handle_client(
                        stream,
                        inbound_tx.clone(),
                        steps.subscribe(),
                        Arc::clone(&closed),
                    ));
                }
            });
        }

        Self {
            url,
            accepted,
            closed,
            inbound,
            steps,
        }
    }

    /// Apply a step to every open server-side connection
    fn step(&self, step: Step) {
        self.steps.send(step).unwrap();
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    async fn next_inbound(&mut self) -> String {
        timeout(EVENT_TIMEOUT, self.inbound.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("server inbound channel closed")
    }

    async fn wait_closed(&self, expected: usize) {
        timeout(EVENT_TIMEOUT, async {
            while self.closed.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for server-side close");
    }
}

async fn handle_client(
    stream: TcpStream,
    inbound: mpsc::UnboundedSender<String>,
    mut steps: broadcast::Receiver<Step>,
    closed: Arc<AtomicUsize>,
) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            step = steps.recv() => match step {
                Ok(Step::Send(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Step::Close) | Err(_) => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(text.to_string());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    closed.fetch_add(1, Ordering::SeqCst);
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("subscriber channel closed")
}

async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<TransportEvent>) {
    if let Ok(event) = timeout(QUIET_PERIOD, events.recv()).await {
        panic!("expected no further events, got {event:?}");
    }
}

#[tokio::test]
async fn test_subscribers_share_one_socket() {
    let server = TestServer::start().await;
    let manager = ConnectionManager::new();
    let (first, mut first_rx) = Subscriber::new();
    let (second, mut second_rx) = Subscriber::new();
    let (third, mut third_rx) = Subscriber::new();

    // Second attaches while the socket is still opening, third once it is open
    manager.connect(&server.url, &first);
    manager.connect(&server.url, &second);
    assert_eq!(next_event(&mut first_rx).await, TransportEvent::Connected);
    assert_eq!(next_event(&mut second_rx).await, TransportEvent::Connected);

    manager.connect(&server.url, &third);
    assert_eq!(next_event(&mut third_rx).await, TransportEvent::Connected);

    assert_eq!(server.accepted(), 1);
    assert_eq!(manager.connection_count(), 1);
    assert_eq!(manager.subscriber_count(&server.url), 3);
    assert_eq!(manager.status(&server.url), ConnectionStatus::Connected);

    server.step(Step::Send(json!({"id": "n1"}).to_string()));
    let expected = TransportEvent::Message(Payload::Json(json!({"id": "n1"})));
    assert_eq!(next_event(&mut first_rx).await, expected);
    assert_eq!(next_event(&mut second_rx).await, expected);
    assert_eq!(next_event(&mut third_rx).await, expected);
}

#[tokio::test]
async fn test_pong_is_filtered_and_order_kept() {
    let server = TestServer::start().await;
    let manager = ConnectionManager::new();
    let (subscriber, mut events) = Subscriber::new();

    manager.connect(&server.url, &subscriber);
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    server.step(Step::Send(r#"{"seq":1}"#.to_string()));
    server.step(Step::Send("pong".to_string()));
    server.step(Step::Send("backend restarting".to_string()));

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message(Payload::Json(json!({"seq": 1})))
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message(Payload::Text("backend restarting".to_string()))
    );
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_heartbeat_sends_ping() {
    let mut server = TestServer::start().await;
    let manager = ConnectionManager::with_config(
        TransportConfig::default().with_heartbeat_interval(Duration::from_millis(50)),
    );
    let (subscriber, mut events) = Subscriber::new();

    manager.connect(&server.url, &subscriber);
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    assert_eq!(server.next_inbound().await, "ping");
    assert_eq!(server.next_inbound().await, "ping");
}

#[tokio::test]
async fn test_handle_sends_outbound_frames() {
    let mut server = TestServer::start().await;
    let manager = ConnectionManager::new();
    let (subscriber, mut events) = Subscriber::new();

    let handle = manager.connect(&server.url, &subscriber);
    assert_eq!(handle.url(), server.url);
    assert_eq!(handle.subscriber(), subscriber.id());
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    assert!(handle.send_text("subscribe:critical"));
    assert!(handle.send_json(&json!({"action": "ack", "id": "n1"})).unwrap());

    assert_eq!(server.next_inbound().await, "subscribe:critical");
    let acked: serde_json::Value = serde_json::from_str(&server.next_inbound().await).unwrap();
    assert_eq!(acked, json!({"action": "ack", "id": "n1"}));
}

#[tokio::test]
async fn test_socket_closes_only_with_last_subscriber() {
    let server = TestServer::start().await;
    let manager = ConnectionManager::new();
    let (first, mut first_rx) = Subscriber::new();
    let (second, mut second_rx) = Subscriber::new();

    manager.connect(&server.url, &first);
    manager.connect(&server.url, &second);
    assert_eq!(next_event(&mut first_rx).await, TransportEvent::Connected);
    assert_eq!(next_event(&mut second_rx).await, TransportEvent::Connected);

    manager.disconnect(&server.url, first.id());
    assert_eq!(manager.connection_count(), 1);
    assert_eq!(manager.status(&server.url), ConnectionStatus::Connected);

    server.step(Step::Send(r#"{"id":"n2"}"#.to_string()));
    assert_eq!(
        next_event(&mut second_rx).await,
        TransportEvent::Message(Payload::Json(json!({"id": "n2"})))
    );
    assert_quiet(&mut first_rx).await;

    manager.disconnect(&server.url, second.id());
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(manager.subscriber_count(&server.url), 0);
    server.wait_closed(1).await;

    // A torn-down socket reports nothing further
    assert_quiet(&mut second_rx).await;
}

#[tokio::test]
async fn test_server_close_then_caller_reconnects() {
    let server = TestServer::start().await;
    let manager = ConnectionManager::new();
    let (subscriber, mut events) = Subscriber::new();

    manager.connect(&server.url, &subscriber);
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    server.step(Step::Close);
    assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(manager.status(&server.url), ConnectionStatus::Disconnected);
    // Subscriber set survives the close
    assert_eq!(manager.subscriber_count(&server.url), 1);

    // No automatic reconnect
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(server.accepted(), 1);

    manager.connect(&server.url, &subscriber);
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert_eq!(server.accepted(), 2);
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
async fn test_connect_failure_is_reported_as_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws/notifications", listener.local_addr().unwrap());
    drop(listener);

    let manager = ConnectionManager::new();
    let (subscriber, mut events) = Subscriber::new();
    manager.connect(&url, &subscriber);

    assert!(matches!(next_event(&mut events).await, TransportEvent::Error(_)));
    assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(manager.subscriber_count(&url), 1);
}

#[tokio::test]
async fn test_dropped_receiver_does_not_starve_others() {
    let server = TestServer::start().await;
    let manager = ConnectionManager::new();
    let (gone, gone_rx) = Subscriber::new();
    let (alive, mut alive_rx) = Subscriber::new();

    manager.connect(&server.url, &gone);
    manager.connect(&server.url, &alive);
    assert_eq!(next_event(&mut alive_rx).await, TransportEvent::Connected);
    drop(gone_rx);

    for seq in 0..3 {
        server.step(Step::Send(json!({"seq": seq}).to_string()));
    }
    for seq in 0..3 {
        assert_eq!(
            next_event(&mut alive_rx).await,
            TransportEvent::Message(Payload::Json(json!({"seq": seq})))
        );
    }
}

mod push_loop {
    use super::*;
    use alertline::{
        ApiError, LocalStore, Notification, NotificationBackend, NotificationCenter,
        notification::{NotificationQuery, NotificationStats},
    };
    use async_trait::async_trait;

    /// Backend with an empty history that counts snapshot fetches
    #[derive(Default)]
    struct CountingBackend {
        lists: AtomicUsize,
    }

    #[async_trait]
    impl NotificationBackend for CountingBackend {
        async fn list_notifications(
            &self,
            _query: NotificationQuery,
        ) -> Result<Vec<Notification>, ApiError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn mark_read(&self, id: &str) -> Result<Notification, ApiError> {
            Err(ApiError::http(404, format!("{id} not found")))
        }

        async fn respond(
            &self,
            id: &str,
            _action: &str,
            _note: Option<&str>,
        ) -> Result<Notification, ApiError> {
            Err(ApiError::http(404, format!("{id} not found")))
        }

        async fn delete_notification(&self, _id: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn stats(&self) -> Result<NotificationStats, ApiError> {
            Ok(NotificationStats::default())
        }
    }

    fn pushed(id: &str) -> String {
        json!({
            "type": "notification",
            "data": {
                "id": id,
                "type": "price_alert",
                "source": "market_data",
                "priority": "high",
                "title": "ETHUSDT crossed 4000",
                "message": "Last trade 4001.5",
                "created_at": "2026-03-01T12:00:00Z"
            }
        })
        .to_string()
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        timeout(EVENT_TIMEOUT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn test_push_loop_merges_and_reconnects() {
        let server = TestServer::start().await;
        let backend = Arc::new(CountingBackend::default());
        let center = Arc::new(NotificationCenter::new(backend.clone(), LocalStore::in_memory()));
        center.activate().await.unwrap();
        let mut alerts = center.subscribe_alerts();

        let manager = ConnectionManager::new();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let push_loop = {
            let center = Arc::clone(&center);
            let manager = manager.clone();
            let url = server.url.clone();
            tokio::spawn(async move { center.run_push_loop(&manager, &url, shutdown_rx).await })
        };

        eventually("connected", || center.is_connected()).await;

        server.step(Step::Send(pushed("p1")));
        server.step(Step::Send(pushed("p1")));
        let alert = timeout(EVENT_TIMEOUT, alerts.recv()).await.unwrap().unwrap();
        assert_eq!(alert.id, "p1");
        eventually("merge", || center.notifications().len() == 1).await;

        server.step(Step::Close);
        eventually("disconnected", || !center.is_connected()).await;
        eventually("reconnected", || center.is_connected() && server.accepted() == 2).await;
        // Gap covered by a fresh snapshot
        eventually("refresh", || backend.lists.load(Ordering::SeqCst) == 2).await;

        shutdown_tx.send(()).await.unwrap();
        timeout(EVENT_TIMEOUT, push_loop).await.unwrap().unwrap();
        assert!(!center.is_connected());
        assert_eq!(manager.connection_count(), 0);
        server.wait_closed(2).await;
    }
}
