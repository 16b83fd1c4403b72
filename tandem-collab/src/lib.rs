//! # tandem-collab: Consistency layer for multi-user text editing
//!
//! Keeps every participant's copy of a file converging while users edit
//! concurrently, and surfaces real conflicts instead of silently picking
//! a winner.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Envelope (bincode)   ┌──────────────┐
//! │ Collaborator │ ◄────────────────────► │ Collaborator │
//! │   (user A)   │      Transport         │   (user B)   │
//! └──────┬───────┘                        └──────┬───────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌──────────────┐                        ┌──────────────┐
//! │ FileReplica  │  log + ack window      │ FileReplica  │
//! │ per file     │  + conflict queue      │ per file     │
//! └──────────────┘                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`collaborator`]: Per-user facade and inbound message handling
//! - [`session`]: Editing sessions, participants and permissions
//! - [`replica`]: Per-file document, operation log and transformation
//! - [`conflict`] / [`resolver`]: Conflict detection and settlement
//! - [`sync`]: Pull, push and replay after partitions
//! - [`presence`]: Cursors, selections and online status
//! - [`room`]: Access-scoped groups of files with a conflict policy
//! - [`events`]: Typed broadcast channels for UI subscribers
//! - [`protocol`] / [`transport`]: Wire format and the network boundary

pub mod collaborator;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod resolver;
pub mod room;
pub mod session;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use collaborator::Collaborator;
pub use config::{CollabConfig, ConfigError};
pub use conflict::{Conflict, ConflictSet, ConflictState, Resolution};
pub use error::CollabError;
pub use events::{
    ChangeEvent, ChangeOrigin, ConflictNotice, EventHub, EventStats, SessionEvent,
    SessionEventKind,
};
pub use oplog::{AckWindow, LogError, OperationLog, Outbox};
pub use presence::{PresenceColor, PresenceStatus, PresenceTracker, PresenceUpdate, UserPresence};
pub use protocol::{Envelope, OperationBatch, Payload, ProtocolError};
pub use replica::{FileReplica, Integration, ReplicaStore, ResolveOutcome};
pub use room::{CollaborationRoom, ConflictPolicy, RoomDirectory};
pub use session::{EditingSession, Permission, SessionManager, SessionState, UserProfile};
pub use sync::{PulledBatch, SyncCoordinator};
pub use transport::{MemoryNetwork, MessageHandler, NetworkStats, Transport, TransportError};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
