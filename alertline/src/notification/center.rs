use super::{
    Notification, NotificationBackend, NotificationError, NotificationQuery, NotificationStats,
    parse_push_notification,
};
use crate::{
    storage::LocalStore,
    transport::{ConnectionManager, Payload, Subscriber, TransportEvent},
};
use chrono::Utc;
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Delay before the push loop re-attaches after its socket drops
pub const PUSH_RECONNECT_DELAY: Duration = Duration::from_secs(2);

const ALERT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct CenterState {
    /// Newest first, unique by id
    notifications: Vec<Notification>,
    dismissed: HashSet<String>,
    connected: bool,
    activated: bool,
    /// Snapshot fetches currently awaiting the backend
    fetches_in_flight: usize,
    /// Ids pushed while a fetch was in flight, tagged with `push_seq` at arrival
    pushed_during_fetch: Vec<(u64, String)>,
    push_seq: u64,
}

/// Merge a newer copy of a notification into the local one. A recorded response never changes
/// or disappears, whatever the incoming copy says.
fn merge_into(existing: &mut Notification, mut incoming: Notification) {
    if existing.responded {
        incoming.responded = true;
        incoming.response_action = existing.response_action.take();
        incoming.response_at = existing.response_at.take();
        incoming.read = true;
    }
    *existing = incoming;
}

/// Deduplicated, newest-first view over REST history and push deliveries.
///
/// `mark_as_read` and `respond` apply locally before the backend call and keep the local
/// change when the call fails. The local state is authoritative until the next
/// [`refresh`](Self::refresh), except that a recorded response is kept through every merge.
pub struct NotificationCenter {
    backend: Arc<dyn NotificationBackend>,
    store: LocalStore,
    state: Mutex<CenterState>,
    alerts: broadcast::Sender<Notification>,
}

impl NotificationCenter {
    pub fn new(backend: Arc<dyn NotificationBackend>, store: LocalStore) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let state = CenterState {
            dismissed: store.dismissed_notifications(),
            ..CenterState::default()
        };

        Self {
            backend,
            store,
            state: Mutex::new(state),
            alerts,
        }
    }

    /// Load the initial snapshot. Later calls are no-ops once a snapshot has loaded.
    pub async fn activate(&self) -> Result<(), NotificationError> {
        if self.state.lock().activated {
            return Ok(());
        }
        self.refresh().await?;
        self.state.lock().activated = true;
        Ok(())
    }

    /// Replace the local collection with a fresh REST snapshot.
    ///
    /// Notifications pushed while the fetch was in flight are newer than the snapshot, so their
    /// local copies are kept.
    pub async fn refresh(&self) -> Result<(), NotificationError> {
        let started_at = {
            let mut state = self.state.lock();
            state.fetches_in_flight += 1;
            state.push_seq
        };

        let fetched = self
            .backend
            .list_notifications(NotificationQuery::default())
            .await;

        let mut state = self.state.lock();
        let pushed: HashSet<String> = state
            .pushed_during_fetch
            .iter()
            .filter(|(seq, _)| *seq >= started_at)
            .map(|(_, id)| id.clone())
            .collect();
        state.fetches_in_flight -= 1;
        if state.fetches_in_flight == 0 {
            state.pushed_during_fetch.clear();
        }

        let mut snapshot = fetched?;
        let mut seen = HashSet::with_capacity(snapshot.len());
        snapshot.retain(|notification| seen.insert(notification.id.clone()));

        let mut kept_pushes = 0;
        for local in &state.notifications {
            if pushed.contains(&local.id) {
                kept_pushes += 1;
                match snapshot.iter_mut().find(|fetched| fetched.id == local.id) {
                    Some(fetched) => *fetched = local.clone(),
                    None => snapshot.push(local.clone()),
                }
            } else if local.responded {
                if let Some(fetched) = snapshot.iter_mut().find(|fetched| fetched.id == local.id) {
                    let mut kept = local.clone();
                    merge_into(&mut kept, fetched.clone());
                    *fetched = kept;
                }
            }
        }
        snapshot.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        info!(count = snapshot.len(), kept_pushes, "notification snapshot loaded");
        state.notifications = snapshot;
        Ok(())
    }

    /// Full history, newest first. Dismissed notifications are included.
    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.clone()
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.state
            .lock()
            .notifications
            .iter()
            .find(|notification| notification.id == id)
            .cloned()
    }

    /// Mirrors the push socket's connected state
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn unread_count(&self) -> usize {
        self.state
            .lock()
            .notifications
            .iter()
            .filter(|notification| !notification.read)
            .count()
    }

    /// Unread, undismissed and unexpired notifications: the ones worth a transient alert
    pub fn pending_toasts(&self) -> Vec<Notification> {
        let now = Utc::now();
        let state = self.state.lock();
        state
            .notifications
            .iter()
            .filter(|notification| {
                !notification.read
                    && !notification.is_expired(now)
                    && !state.dismissed.contains(&notification.id)
            })
            .cloned()
            .collect()
    }

    /// Receiver of every newly pushed notification
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Notification> {
        self.alerts.subscribe()
    }

    /// Merge one pushed notification. Returns true if its id was not present before.
    pub fn apply_push(&self, notification: Notification) -> bool {
        let inserted = {
            let mut state = self.state.lock();
            if state.fetches_in_flight > 0 {
                let seq = state.push_seq;
                state.pushed_during_fetch.push((seq, notification.id.clone()));
            }
            state.push_seq += 1;

            match state
                .notifications
                .iter_mut()
                .find(|existing| existing.id == notification.id)
            {
                Some(existing) => {
                    debug!(id = %notification.id, "push updated existing notification");
                    merge_into(existing, notification.clone());
                    false
                }
                None => {
                    state.notifications.insert(0, notification.clone());
                    true
                }
            }
        };

        if inserted {
            debug!(id = %notification.id, priority = %notification.priority, "new notification");
            // No receivers is fine
            let _ = self.alerts.send(notification);
        }
        inserted
    }

    pub async fn mark_as_read(&self, id: &str) -> Result<(), NotificationError> {
        {
            let mut state = self.state.lock();
            let notification = find_mut(&mut state.notifications, id)?;
            if notification.read {
                return Ok(());
            }
            notification.read = true;
        }

        match self.backend.mark_read(id).await {
            Ok(confirmed) => {
                self.reconcile(confirmed);
                Ok(())
            }
            Err(error) => {
                warn!(id, %error, "mark-as-read failed, keeping local state until refresh");
                Err(error.into())
            }
        }
    }

    /// Record a response to an actionable notification.
    ///
    /// `action` must be one of the notification's allowed actions, and a notification can only
    /// be responded to once.
    pub async fn respond(
        &self,
        id: &str,
        action: &str,
        note: Option<&str>,
    ) -> Result<(), NotificationError> {
        {
            let mut state = self.state.lock();
            let notification = find_mut(&mut state.notifications, id)?;
            if notification.responded {
                return Err(NotificationError::AlreadyResponded(id.to_string()));
            }
            if !notification.allows_action(action) {
                return Err(NotificationError::ActionNotAllowed {
                    id: id.to_string(),
                    action: action.to_string(),
                });
            }
            notification.responded = true;
            notification.response_action = Some(action.to_string());
            notification.response_at = Some(Utc::now());
            notification.read = true;
        }

        match self.backend.respond(id, action, note).await {
            Ok(confirmed) => {
                self.reconcile(confirmed);
                Ok(())
            }
            Err(error) => {
                warn!(id, action, %error, "respond failed, keeping local state until refresh");
                Err(error.into())
            }
        }
    }

    /// Hide a notification from transient alerts without marking it read
    pub fn dismiss(&self, id: &str) {
        let mut state = self.state.lock();
        if state.dismissed.insert(id.to_string()) {
            self.store.set_dismissed_notifications(&state.dismissed);
        }
    }

    pub fn is_dismissed(&self, id: &str) -> bool {
        self.state.lock().dismissed.contains(id)
    }

    /// Delete on the backend, then drop the local copy
    pub async fn remove(&self, id: &str) -> Result<(), NotificationError> {
        self.backend.delete_notification(id).await?;

        let mut state = self.state.lock();
        state.notifications.retain(|notification| notification.id != id);
        if state.dismissed.remove(id) {
            self.store.set_dismissed_notifications(&state.dismissed);
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<NotificationStats, NotificationError> {
        Ok(self.backend.stats().await?)
    }

    /// Apply one transport event for the push endpoint
    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.set_connected(true),
            TransportEvent::Disconnected => self.set_connected(false),
            TransportEvent::Error(error) => {
                warn!(%error, "push endpoint error");
                self.set_connected(false);
            }
            TransportEvent::Message(Payload::Json(value)) => {
                match parse_push_notification(&value) {
                    Some(notification) => {
                        self.apply_push(notification);
                    }
                    None => debug!(payload = %value, "ignoring non-notification push payload"),
                }
            }
            TransportEvent::Message(Payload::Text(text)) => {
                debug!(%text, "ignoring text push payload");
            }
        }
    }

    /// Follow the push endpoint until `shutdown` fires or its sender is dropped.
    ///
    /// Re-attaches the same subscriber after every drop, waiting [`PUSH_RECONNECT_DELAY`]
    /// first, and refreshes the snapshot once a re-attach succeeds to cover the gap.
    pub async fn run_push_loop(
        &self,
        manager: &ConnectionManager,
        url: &str,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        let (subscriber, mut events) = Subscriber::new();
        manager.connect(url, &subscriber);
        let mut recovering = false;

        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::Disconnected => {
                    self.handle_transport_event(TransportEvent::Disconnected);
                    recovering = true;
                    info!(
                        url,
                        delay_ms = PUSH_RECONNECT_DELAY.as_millis() as u64,
                        "push endpoint dropped, reconnecting"
                    );

                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(PUSH_RECONNECT_DELAY) => {}
                    }
                    manager.connect(url, &subscriber);
                }
                TransportEvent::Connected => {
                    self.handle_transport_event(TransportEvent::Connected);
                    if std::mem::take(&mut recovering) {
                        if let Err(error) = self.refresh().await {
                            warn!(%error, "refresh after reconnect failed");
                        }
                    }
                }
                event => self.handle_transport_event(event),
            }
        }

        manager.disconnect(url, subscriber.id());
        self.set_connected(false);
        info!(url, "push loop stopped");
    }

    fn set_connected(&self, connected: bool) {
        let mut state = self.state.lock();
        if state.connected != connected {
            info!(connected, "push connectivity changed");
            state.connected = connected;
        }
    }

    /// Merge the backend's confirmed version into the local copy, if still present
    fn reconcile(&self, confirmed: Notification) {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .notifications
            .iter_mut()
            .find(|existing| existing.id == confirmed.id)
        {
            merge_into(existing, confirmed);
        }
    }
}

fn find_mut<'a>(
    notifications: &'a mut [Notification],
    id: &str,
) -> Result<&'a mut Notification, NotificationError> {
    notifications
        .iter_mut()
        .find(|notification| notification.id == id)
        .ok_or_else(|| NotificationError::NotFound(id.to_string()))
}
