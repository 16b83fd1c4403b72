//! # tandem-core: text model for collaborative editing
//!
//! Positions, ranges, immutable change operations and the line buffer they
//! apply to. Nothing here knows about peers or sessions; that lives in
//! `tandem-collab`.
//!
//! ## Modules
//!
//! - [`position`]: 1-based line/column positions and half-open ranges
//! - [`edit`]: the replace-range primitive and position mapping
//! - [`operation`]: `ChangeOperation` (insert, delete, replace, undo, redo)
//! - [`document`]: `TextDocument` and deterministic `replay`
//! - [`clock`]: Lamport clock

pub mod clock;
pub mod document;
pub mod edit;
pub mod operation;
pub mod position;

pub use clock::LamportClock;
pub use document::{replay, DocumentError, TextDocument};
pub use edit::Edit;
pub use operation::{ChangeOperation, OperationKind};
pub use position::{Position, TextRange};

pub type UserId = uuid::Uuid;
pub type OperationId = uuid::Uuid;
pub type SessionId = uuid::Uuid;
pub type ConflictId = uuid::Uuid;
pub type RoomId = uuid::Uuid;
