//! Wire protocol between collaborators.
//!
//! Every message is one bincode-encoded [`Envelope`]:
//!
//! ```text
//! ┌───────────┬──────────────┬──────────┬─────────────────┐
//! │ sender    │ recipients   │ clock    │ payload         │
//! │ 16 bytes  │ varint + 16n │ varint   │ enum + variable │
//! └───────────┴──────────────┴──────────┴─────────────────┘
//! ```
//!
//! Operation batches (pull responses, outbox pushes) are bincode-encoded
//! and then LZ4-compressed, since typed text compresses well.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tandem_core::{ChangeOperation, OperationId, SessionId, UserId};

use crate::events::SessionEvent;
use crate::presence::UserPresence;
use crate::session::EditingSession;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Decompression failed: {0}")]
    Decompression(String),
    #[error("Batch of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("Unexpected payload: expected {expected}, got {got}")]
    UnexpectedPayload {
        expected: &'static str,
        got: &'static str,
    },
}

/// Largest decompressed batch accepted from a peer.
pub const MAX_BATCH_BYTES: usize = 16 * 1024 * 1024;

/// LZ4-compressed, bincode-encoded run of operations for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub file_path: String,
    pub count: u32,
    pub original_size: u32,
    pub compressed: Vec<u8>,
}

impl OperationBatch {
    pub fn compress(
        file_path: impl Into<String>,
        ops: &[ChangeOperation],
    ) -> Result<Self, ProtocolError> {
        let raw = bincode::serde::encode_to_vec(ops, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            file_path: file_path.into(),
            count: ops.len() as u32,
            original_size: raw.len() as u32,
            compressed: lz4_flex::compress_prepend_size(&raw),
        })
    }

    /// Decode the batch. The size prefix is checked against
    /// `original_size` and [`MAX_BATCH_BYTES`] before anything is
    /// allocated for it.
    pub fn decompress(&self) -> Result<Vec<ChangeOperation>, ProtocolError> {
        let (prefix, block) = self
            .compressed
            .split_first_chunk::<4>()
            .ok_or_else(|| ProtocolError::Decompression("missing size prefix".into()))?;
        let size = u32::from_le_bytes(*prefix) as usize;
        if size != self.original_size as usize {
            return Err(ProtocolError::Decompression(format!(
                "size prefix {size} does not match original size {}",
                self.original_size
            )));
        }
        if size > MAX_BATCH_BYTES {
            return Err(ProtocolError::TooLarge {
                size,
                limit: MAX_BATCH_BYTES,
            });
        }

        let raw = lz4_flex::decompress(block, size)
            .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
        let config = bincode::config::standard().with_limit::<MAX_BATCH_BYTES>();
        let (ops, _) = bincode::serde::decode_from_slice(&raw, config)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(ops)
    }

    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A new operation from its author.
    Change {
        session_id: SessionId,
        operation: ChangeOperation,
    },
    /// The sender has applied `operation_id`.
    Ack {
        file_path: String,
        operation_id: OperationId,
    },
    Presence(UserPresence),
    /// Membership and lifecycle changes.
    Event(SessionEvent),
    /// A session the recipient was named in.
    SessionAnnounce(EditingSession),
    /// A conflict settled without a new operation: `winner` stays,
    /// `loser` is dropped. `timestamp` orders competing resolutions.
    Resolution {
        file_path: String,
        winner: OperationId,
        loser: OperationId,
        timestamp: u64,
    },
    FetchSession {
        session_id: SessionId,
    },
    SessionSnapshot(Option<EditingSession>),
    /// Operations after `after` in the responder's log, skipping other
    /// authors' operations the requester already has per `seen`.
    PullRequest {
        file_path: String,
        after: Option<OperationId>,
        seen: HashMap<UserId, u64>,
    },
    PullResponse(OperationBatch),
    /// Buffered operations from their author.
    Push(OperationBatch),
    PushAck {
        file_path: String,
        accepted: u32,
    },
    Ping,
    Pong,
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Change { .. } => "change",
            Payload::Ack { .. } => "ack",
            Payload::Presence(_) => "presence",
            Payload::Event(_) => "event",
            Payload::SessionAnnounce(_) => "session_announce",
            Payload::Resolution { .. } => "resolution",
            Payload::FetchSession { .. } => "fetch_session",
            Payload::SessionSnapshot(_) => "session_snapshot",
            Payload::PullRequest { .. } => "pull_request",
            Payload::PullResponse(_) => "pull_response",
            Payload::Push(_) => "push",
            Payload::PushAck { .. } => "push_ack",
            Payload::Ping => "ping",
            Payload::Pong => "pong",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: UserId,
    pub recipients: Vec<UserId>,
    /// Sender's Lamport time, 0 when not meaningful.
    pub clock: u64,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender: UserId, recipients: Vec<UserId>, payload: Payload) -> Self {
        Self {
            sender,
            recipients,
            clock: 0,
            payload,
        }
    }

    /// Envelope for a single recipient.
    pub fn to(sender: UserId, recipient: UserId, payload: Payload) -> Self {
        Self::new(sender, vec![recipient], payload)
    }

    pub fn with_clock(mut self, clock: u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }

    pub(crate) fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedPayload {
            expected,
            got: self.payload.name(),
        }
    }
}
