use thiserror::Error;
use uuid::Uuid;

use tandem_core::{ConflictId, DocumentError, OperationId, RoomId, SessionId, UserId};

use crate::oplog::LogError;
use crate::protocol::ProtocolError;
use crate::session::Permission;
use crate::transport::TransportError;

/// Everything a collaborator call can fail with.
///
/// Conflicts are not errors; they are queued and reported on the conflict
/// topic instead.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),
    #[error("Session {0} is not active")]
    SessionInactive(SessionId),
    #[error("Unknown user {0}")]
    UnknownUser(UserId),
    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),
    #[error("Conflict {0} not found")]
    ConflictNotFound(ConflictId),
    /// `scope` is the session or room the check ran against.
    #[error("User {user} needs {required} permission in {scope}")]
    PermissionDenied {
        user: UserId,
        scope: Uuid,
        required: Permission,
    },
    #[error("{file_path} already has active session {session_id}")]
    SessionAlreadyActive {
        file_path: String,
        session_id: SessionId,
    },
    #[error("User {user} is not a participant of session {session_id}")]
    NotParticipant { user: UserId, session_id: SessionId },
    #[error("Operation {operation} is stale: {reason}")]
    StaleOperation {
        operation: OperationId,
        reason: String,
    },
    #[error("Merge resolution requires merged content")]
    MergeContentRequired,
    #[error("No active session for {0}")]
    NoSessionForFile(String),
    #[error("Room {0} not found")]
    RoomNotFound(RoomId),
    #[error("No participant of {0} is reachable")]
    NoReachablePeer(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CollabError {
    pub(crate) fn stale(operation: OperationId, reason: impl Into<String>) -> Self {
        CollabError::StaleOperation {
            operation,
            reason: reason.into(),
        }
    }
}
