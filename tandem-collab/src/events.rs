//! Typed subscription points.
//!
//! One tokio broadcast channel per topic, so subscribers only see the
//! payload type they asked for. Each subscriber buffers up to `capacity`
//! events; a slow subscriber lags and skips rather than blocking
//! publishers. Publishing with nobody subscribed is not an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tandem_core::{ChangeOperation, ConflictId, OperationId, Position, SessionId, UserId};

use crate::conflict::Conflict;
use crate::presence::UserPresence;
use crate::session::Permission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// An operation that reached the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub session_id: SessionId,
    pub operation: ChangeOperation,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictNotice {
    Detected(Conflict),
    Resolved(Conflict),
}

impl ConflictNotice {
    pub fn conflict(&self) -> &Conflict {
        match self {
            ConflictNotice::Detected(c) | ConflictNotice::Resolved(c) => c,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    UserJoined {
        display_name: String,
        permission: Permission,
    },
    UserLeft,
    UserMoved {
        cursor: Option<Position>,
    },
    FileOpened {
        file_path: String,
    },
    FileClosed {
        file_path: String,
    },
    Change {
        operation_id: OperationId,
    },
    Conflict {
        conflict_id: ConflictId,
    },
    PermissionChanged {
        permission: Permission,
    },
    SessionEnded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub user_id: UserId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, user_id: UserId, kind: SessionEventKind) -> Self {
        Self {
            session_id,
            user_id,
            timestamp: crate::now_ms(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    pub published: u64,
    /// Events published while the topic had no subscribers.
    pub unobserved: u64,
}

#[derive(Default)]
struct AtomicEventStats {
    published: AtomicU64,
    unobserved: AtomicU64,
}

pub struct EventHub {
    changes: broadcast::Sender<ChangeEvent>,
    presence: broadcast::Sender<UserPresence>,
    conflicts: broadcast::Sender<ConflictNotice>,
    sessions: broadcast::Sender<SessionEvent>,
    capacity: usize,
    stats: Arc<AtomicEventStats>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            changes: broadcast::channel(capacity).0,
            presence: broadcast::channel(capacity).0,
            conflicts: broadcast::channel(capacity).0,
            sessions: broadcast::channel(capacity).0,
            capacity,
            stats: Arc::new(AtomicEventStats::default()),
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<UserPresence> {
        self.presence.subscribe()
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictNotice> {
        self.conflicts.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }

    fn record(&self, receivers: usize) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        if receivers == 0 {
            self.stats.unobserved.fetch_add(1, Ordering::Relaxed);
        }
        receivers
    }

    /// Returns the number of subscribers reached.
    pub fn publish_change(&self, event: ChangeEvent) -> usize {
        self.record(self.changes.send(event).unwrap_or(0))
    }

    pub fn publish_presence(&self, presence: UserPresence) -> usize {
        self.record(self.presence.send(presence).unwrap_or(0))
    }

    pub fn publish_conflict(&self, notice: ConflictNotice) -> usize {
        self.record(self.conflicts.send(notice).unwrap_or(0))
    }

    pub fn publish_session(&self, event: SessionEvent) -> usize {
        log::trace!("Session event {:?} for {}", event.kind, event.session_id);
        self.record(self.sessions.send(event).unwrap_or(0))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.stats.published.load(Ordering::Relaxed),
            unobserved: self.stats.unobserved.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_session_topic_fan_out() {
        let hub = EventHub::new(16);
        let mut rx1 = hub.subscribe_sessions();
        let mut rx2 = hub.subscribe_sessions();

        let event = SessionEvent::new(Uuid::new_v4(), Uuid::new_v4(), SessionEventKind::UserLeft);
        assert_eq!(hub.publish_session(event.clone()), 2);

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let hub = EventHub::new(16);
        let mut sessions = hub.subscribe_sessions();
        let _changes = hub.subscribe_changes();

        let presence = UserPresence::new(Uuid::new_v4(), "Alice", 0);
        assert_eq!(hub.publish_presence(presence), 0);
        assert!(sessions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats_count_unobserved() {
        let hub = EventHub::new(4);
        let event = SessionEvent::new(Uuid::new_v4(), Uuid::new_v4(), SessionEventKind::SessionEnded);
        hub.publish_session(event.clone());

        let _rx = hub.subscribe_sessions();
        hub.publish_session(event);

        let stats = hub.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.unobserved, 1);
        assert_eq!(hub.capacity(), 4);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips() {
        let hub = EventHub::new(2);
        let mut rx = hub.subscribe_sessions();
        let session = Uuid::new_v4();
        for _ in 0..5 {
            hub.publish_session(SessionEvent::new(session, Uuid::new_v4(), SessionEventKind::UserLeft));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
