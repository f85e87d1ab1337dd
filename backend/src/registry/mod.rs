//! Process-local live-connection registry.
//!
//! Maps each subscriber to the set of duplex connections they currently
//! hold. The map is mutex-guarded and never exposed raw; push operations
//! clone the connection handles out of the lock before awaiting any send,
//! so a slow socket cannot stall registration or disconnects. Presence
//! transitions (a user's connection count crossing 0↔1) are published on a
//! broadcast channel.
//!
//! Deliberately single-process: cross-instance presence needs an external
//! layer and is not built here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockable::Clock;
use tokio::sync::broadcast;

use crate::domain::message::{NotificationEnvelope, UserId};
use crate::domain::ports::{ConnectionRegistry, PresenceSnapshotEntry};

/// Handle identifying one tracked connection within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Outbound half of one duplex connection.
///
/// Implemented over `actix_ws::Session` in production and over channel
/// doubles in tests.
#[async_trait]
pub trait SocketSink: Send + Sync {
    /// Send one text frame. An error means the connection is unusable and
    /// will be evicted.
    async fn send_text(&self, frame: &str) -> Result<(), SinkClosed>;

    /// Close the connection. Best effort; errors are ignored by callers.
    async fn close(&self);
}

/// The connection refused a frame (closed or broken).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Presence transition published when a user's connection count crosses
/// zero in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEvent {
    /// User whose presence changed.
    pub user_id: UserId,
    /// True on 0→1, false on 1→0.
    pub online: bool,
    /// Transition timestamp.
    pub at: DateTime<Utc>,
}

struct ConnectionEntry {
    id: ConnectionId,
    sink: Arc<dyn SocketSink>,
    last_seen_at: DateTime<Utc>,
}

/// Mutex-guarded registry of live connections.
pub struct SocketRegistry {
    inner: Mutex<HashMap<UserId, Vec<ConnectionEntry>>>,
    presence: broadcast::Sender<PresenceEvent>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

const PRESENCE_CHANNEL_CAPACITY: usize = 64;

impl SocketRegistry {
    /// Build an empty registry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (presence, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(HashMap::new()),
            presence,
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    /// Subscribe to presence transitions. Lagging receivers drop the oldest
    /// events rather than blocking registry mutation.
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    /// Track a newly accepted connection. Emits an online presence event
    /// when this is the user's first connection.
    pub fn add(&self, user_id: UserId, sink: Arc<dyn SocketSink>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = self.clock.utc();
        let went_online = {
            let mut map = self.lock();
            let entries = map.entry(user_id).or_default();
            let was_empty = entries.is_empty();
            entries.push(ConnectionEntry {
                id,
                sink,
                last_seen_at: now,
            });
            was_empty
        };
        if went_online {
            let _ = self.presence.send(PresenceEvent {
                user_id,
                online: true,
                at: now,
            });
        }
        tracing::debug!(%user_id, connection = id.0, "connection registered");
        id
    }

    /// Drop a connection. Emits an offline presence event when it was the
    /// user's last one. Unknown ids are ignored.
    pub fn remove(&self, user_id: UserId, id: ConnectionId) {
        let went_offline = {
            let mut map = self.lock();
            let Some(entries) = map.get_mut(&user_id) else {
                return;
            };
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                map.remove(&user_id);
                true
            } else {
                false
            }
        };
        if went_offline {
            let _ = self.presence.send(PresenceEvent {
                user_id,
                online: false,
                at: self.clock.utc(),
            });
        }
        tracing::debug!(%user_id, connection = id.0, "connection removed");
    }

    /// Record traffic on a connection, refreshing its `last_seen_at`.
    pub fn touch(&self, user_id: UserId, id: ConnectionId) {
        let now = self.clock.utc();
        let mut map = self.lock();
        if let Some(entry) = map
            .get_mut(&user_id)
            .and_then(|entries| entries.iter_mut().find(|entry| entry.id == id))
        {
            entry.last_seen_at = now;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Vec<ConnectionEntry>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a frame to every connection of one user.
    ///
    /// Handles are cloned out of the lock before any await. A failure on
    /// one connection does not abort the others; each failed connection is
    /// closed and evicted. Returns true iff at least one send succeeded.
    async fn push_frame(&self, user_id: UserId, frame: &str) -> bool {
        let targets: Vec<(ConnectionId, Arc<dyn SocketSink>)> = {
            let map = self.lock();
            match map.get(&user_id) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| (entry.id, Arc::clone(&entry.sink)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = false;
        for (id, sink) in targets {
            match sink.send_text(frame).await {
                Ok(()) => delivered = true,
                Err(SinkClosed) => {
                    tracing::debug!(%user_id, connection = id.0, "evicting dead connection");
                    sink.close().await;
                    self.remove(user_id, id);
                }
            }
        }
        delivered
    }

    fn encode(envelope: &NotificationEnvelope) -> Option<String> {
        match serde_json::to_string(envelope) {
            Ok(frame) => Some(frame),
            Err(error) => {
                tracing::error!(%error, "failed to serialise notification frame");
                None
            }
        }
    }
}

#[async_trait]
impl ConnectionRegistry for SocketRegistry {
    async fn push(&self, user_id: UserId, envelope: &NotificationEnvelope) -> bool {
        let Some(frame) = Self::encode(envelope) else {
            return false;
        };
        self.push_frame(user_id, &frame).await
    }

    async fn broadcast_all(&self, envelope: &NotificationEnvelope) -> usize {
        let Some(frame) = Self::encode(envelope) else {
            return 0;
        };
        let users: Vec<UserId> = {
            let map = self.lock();
            map.keys().copied().collect()
        };
        let mut accepted = 0_usize;
        for user_id in users {
            if self.push_frame(user_id, &frame).await {
                accepted += 1;
            }
        }
        accepted
    }

    fn is_online(&self, user_id: UserId) -> bool {
        let map = self.lock();
        map.get(&user_id).is_some_and(|entries| !entries.is_empty())
    }

    fn snapshot(&self) -> Vec<PresenceSnapshotEntry> {
        let map = self.lock();
        let mut entries: Vec<PresenceSnapshotEntry> = map
            .iter()
            .filter(|(_, connections)| !connections.is_empty())
            .map(|(user_id, connections)| PresenceSnapshotEntry {
                user_id: *user_id,
                open_count: connections.len(),
                last_seen_at: connections
                    .iter()
                    .map(|entry| entry.last_seen_at)
                    .max()
                    .unwrap_or_else(Utc::now),
            })
            .collect();
        entries.sort_by_key(|entry| entry.user_id);
        entries
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use mockable::DefaultClock;
    use rstest::rstest;

    use super::*;
    use crate::domain::message::MessageId;

    struct RecordingSink {
        frames: StdMutex<Vec<String>>,
        healthy: bool,
        closed: StdMutex<bool>,
    }

    impl RecordingSink {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                frames: StdMutex::new(Vec::new()),
                healthy: true,
                closed: StdMutex::new(false),
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                frames: StdMutex::new(Vec::new()),
                healthy: false,
                closed: StdMutex::new(false),
            })
        }

        fn frame_count(&self) -> usize {
            self.frames.lock().expect("frames mutex").len()
        }

        fn was_closed(&self) -> bool {
            *self.closed.lock().expect("closed mutex")
        }
    }

    #[async_trait]
    impl SocketSink for RecordingSink {
        async fn send_text(&self, frame: &str) -> Result<(), SinkClosed> {
            if !self.healthy {
                return Err(SinkClosed);
            }
            self.frames
                .lock()
                .expect("frames mutex")
                .push(frame.to_owned());
            Ok(())
        }

        async fn close(&self) {
            *self.closed.lock().expect("closed mutex") = true;
        }
    }

    fn envelope() -> NotificationEnvelope {
        NotificationEnvelope {
            kind: "notification",
            message_id: MessageId::random(),
            title: "Build finished".to_owned(),
            body: "pipeline #42 is green".to_owned(),
            payload: None,
        }
    }

    fn registry() -> SocketRegistry {
        SocketRegistry::new(Arc::new(DefaultClock))
    }

    #[rstest]
    #[tokio::test]
    async fn push_reaches_every_open_connection() {
        let registry = registry();
        let user = UserId::random();
        let first = RecordingSink::healthy();
        let second = RecordingSink::healthy();
        registry.add(user, Arc::clone(&first) as Arc<dyn SocketSink>);
        registry.add(user, Arc::clone(&second) as Arc<dyn SocketSink>);

        assert!(registry.push(user, &envelope()).await);
        assert_eq!(first.frame_count(), 1);
        assert_eq!(second.frame_count(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn push_to_offline_user_returns_false() {
        let registry = registry();
        assert!(!registry.push(UserId::random(), &envelope()).await);
    }

    #[rstest]
    #[tokio::test]
    async fn broken_connection_is_evicted_without_aborting_push() {
        let registry = registry();
        let user = UserId::random();
        let broken = RecordingSink::broken();
        let healthy = RecordingSink::healthy();
        registry.add(user, Arc::clone(&broken) as Arc<dyn SocketSink>);
        registry.add(user, Arc::clone(&healthy) as Arc<dyn SocketSink>);

        assert!(registry.push(user, &envelope()).await);
        assert!(broken.was_closed());
        assert_eq!(healthy.frame_count(), 1);

        // The evicted connection no longer appears in snapshots.
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].open_count, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn presence_fires_only_on_zero_crossings() {
        let registry = registry();
        let user = UserId::random();
        let mut events = registry.subscribe_presence();

        let first = registry.add(user, RecordingSink::healthy() as Arc<dyn SocketSink>);
        let second = registry.add(user, RecordingSink::healthy() as Arc<dyn SocketSink>);
        registry.remove(user, first);
        registry.remove(user, second);

        let online = events.try_recv().expect("online event");
        assert!(online.online);
        assert_eq!(online.user_id, user);
        let offline = events.try_recv().expect("offline event");
        assert!(!offline.online);
        // No event for the 1→2 or 2→1 transitions.
        assert!(events.try_recv().is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn broadcast_counts_users_not_connections() {
        let registry = registry();
        let solo = UserId::random();
        let dual = UserId::random();
        registry.add(solo, RecordingSink::healthy() as Arc<dyn SocketSink>);
        registry.add(dual, RecordingSink::healthy() as Arc<dyn SocketSink>);
        registry.add(dual, RecordingSink::healthy() as Arc<dyn SocketSink>);

        assert_eq!(registry.broadcast_all(&envelope()).await, 2);
    }

    #[rstest]
    fn online_check_tracks_registration() {
        let registry = registry();
        let user = UserId::random();
        assert!(!registry.is_online(user));
        let id = registry.add(user, RecordingSink::healthy() as Arc<dyn SocketSink>);
        assert!(registry.is_online(user));
        registry.remove(user, id);
        assert!(!registry.is_online(user));
    }
}
