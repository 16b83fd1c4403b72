//! Immutable change operations.
//!
//! An operation is created once by its author and never mutated afterwards.
//! Later operations may supersede it (undo, conflict correction) but the
//! original stays in every log that recorded it.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::edit::Edit;
use crate::position::{Position, TextRange};
use crate::{OperationId, UserId};

/// What an operation does to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Delete,
    /// Range replaced with new text. Also used for conflict corrections.
    Replace,
    Undo,
    Redo,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Delete => "delete",
            OperationKind::Replace => "replace",
            OperationKind::Undo => "undo",
            OperationKind::Redo => "redo",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One text mutation by one author.
///
/// `range` is expressed in the coordinates of the document the author saw
/// when creating the operation. `text` is what gets written over `range` and
/// `replaced` is what `range` contained (kept for diagnostics and undo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOperation {
    id: OperationId,
    author: UserId,
    file_path: String,
    timestamp: u64,
    kind: OperationKind,
    range: TextRange,
    text: String,
    replaced: String,
    target: Option<OperationId>,
    supersedes: Vec<OperationId>,
}

impl ChangeOperation {
    #[allow(clippy::too_many_arguments)]
    fn build(
        author: UserId,
        file_path: String,
        timestamp: u64,
        kind: OperationKind,
        range: TextRange,
        text: String,
        replaced: String,
        target: Option<OperationId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            file_path,
            timestamp,
            kind,
            range,
            text,
            replaced,
            target,
            supersedes: Vec::new(),
        }
    }

    /// Insert `text` at `at`.
    pub fn insert(
        author: UserId,
        file_path: impl Into<String>,
        timestamp: u64,
        at: Position,
        text: impl Into<String>,
    ) -> Self {
        Self::build(
            author,
            file_path.into(),
            timestamp,
            OperationKind::Insert,
            TextRange::point(at),
            text.into(),
            String::new(),
            None,
        )
    }

    /// Delete `range`, which held `replaced`.
    pub fn delete(
        author: UserId,
        file_path: impl Into<String>,
        timestamp: u64,
        range: TextRange,
        replaced: impl Into<String>,
    ) -> Self {
        Self::build(
            author,
            file_path.into(),
            timestamp,
            OperationKind::Delete,
            range,
            String::new(),
            replaced.into(),
            None,
        )
    }

    /// Replace `range` (holding `replaced`) with `text`.
    pub fn replace(
        author: UserId,
        file_path: impl Into<String>,
        timestamp: u64,
        range: TextRange,
        text: impl Into<String>,
        replaced: impl Into<String>,
    ) -> Self {
        Self::build(
            author,
            file_path.into(),
            timestamp,
            OperationKind::Replace,
            range,
            text.into(),
            replaced.into(),
            None,
        )
    }

    /// Inverse of `target`: its inserted span is replaced by what it removed.
    pub fn undo(author: UserId, timestamp: u64, target: &ChangeOperation) -> Self {
        let inverse = target.edit().inverse(&target.replaced);
        Self::build(
            author,
            target.file_path.clone(),
            timestamp,
            OperationKind::Undo,
            inverse.range,
            inverse.text,
            target.text.clone(),
            Some(target.id),
        )
    }

    /// Re-apply what `undo` took back.
    pub fn redo(author: UserId, timestamp: u64, undo: &ChangeOperation) -> Self {
        let inverse = undo.edit().inverse(&undo.replaced);
        Self::build(
            author,
            undo.file_path.clone(),
            timestamp,
            OperationKind::Redo,
            inverse.range,
            inverse.text,
            undo.text.clone(),
            Some(undo.id),
        )
    }

    /// Replace operation that settles a conflict between `supersedes`.
    pub fn correction(
        author: UserId,
        file_path: impl Into<String>,
        timestamp: u64,
        range: TextRange,
        text: impl Into<String>,
        replaced: impl Into<String>,
        supersedes: Vec<OperationId>,
    ) -> Self {
        let mut op = Self::replace(author, file_path, timestamp, range, text, replaced);
        op.supersedes = supersedes;
        op
    }

    /// Copy of this operation positioned at `range`, keeping its identity.
    ///
    /// Used when a remote operation is shifted past concurrent local edits.
    pub fn rebased(&self, range: TextRange) -> Self {
        let mut op = self.clone();
        op.range = range;
        op
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn author(&self) -> UserId {
        self.author
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Lamport timestamp assigned by the author.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn range(&self) -> TextRange {
        self.range
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn replaced(&self) -> &str {
        &self.replaced
    }

    /// Operation an undo or redo refers to.
    pub fn target(&self) -> Option<OperationId> {
        self.target
    }

    /// Operations a conflict correction settles. Empty for ordinary edits.
    pub fn supersedes(&self) -> &[OperationId] {
        &self.supersedes
    }

    pub fn is_correction(&self) -> bool {
        !self.supersedes.is_empty()
    }

    /// The document edit this operation performs.
    pub fn edit(&self) -> Edit {
        Edit::new(self.range, self.text.clone())
    }

    /// Range covered by this operation's text after it is applied.
    pub fn post_range(&self) -> TextRange {
        self.edit().post_range()
    }

    /// Total order used wherever replicas must agree on a winner without
    /// talking to each other: Lamport timestamp, then author id.
    pub fn precedence(&self) -> (u64, UserId) {
        (self.timestamp, self.author)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        Uuid::new_v4()
    }

    #[test]
    fn test_insert_is_point_range() {
        let op = ChangeOperation::insert(user(), "a.rs", 1, Position::new(2, 4), "hi");
        assert_eq!(op.kind(), OperationKind::Insert);
        assert!(op.range().is_empty());
        assert_eq!(op.post_range(), TextRange::from_coords(2, 4, 2, 6));
        assert!(!op.is_correction());
    }

    #[test]
    fn test_unique_ids() {
        let author = user();
        let a = ChangeOperation::insert(author, "a.rs", 1, Position::START, "x");
        let b = ChangeOperation::insert(author, "a.rs", 1, Position::START, "x");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_undo_of_insert_deletes_inserted_span() {
        let author = user();
        let insert = ChangeOperation::insert(author, "a.rs", 1, Position::START, "foo");
        let undo = ChangeOperation::undo(author, 2, &insert);

        assert_eq!(undo.kind(), OperationKind::Undo);
        assert_eq!(undo.range(), TextRange::from_coords(1, 1, 1, 4));
        assert_eq!(undo.text(), "");
        assert_eq!(undo.replaced(), "foo");
        assert_eq!(undo.target(), Some(insert.id()));
    }

    #[test]
    fn test_redo_restores_original_effect() {
        let author = user();
        let delete = ChangeOperation::delete(author, "a.rs", 1, TextRange::from_coords(1, 2, 1, 5), "bcd");
        let undo = ChangeOperation::undo(author, 2, &delete);
        let redo = ChangeOperation::redo(author, 3, &undo);

        assert_eq!(undo.range(), TextRange::point(Position::new(1, 2)));
        assert_eq!(undo.text(), "bcd");
        assert_eq!(redo.kind(), OperationKind::Redo);
        assert_eq!(redo.edit(), delete.edit());
        assert_eq!(redo.target(), Some(undo.id()));
    }

    #[test]
    fn test_correction_records_superseded_pair() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let op = ChangeOperation::correction(
            user(),
            "a.rs",
            9,
            TextRange::from_coords(1, 1, 1, 7),
            "foo",
            "fooabc",
            vec![a, b],
        );
        assert_eq!(op.kind(), OperationKind::Replace);
        assert!(op.is_correction());
        assert_eq!(op.supersedes(), &[a, b]);
    }

    #[test]
    fn test_rebased_keeps_identity() {
        let op = ChangeOperation::insert(user(), "a.rs", 1, Position::new(3, 1), "x");
        let moved = op.rebased(TextRange::point(Position::new(4, 1)));
        assert_eq!(moved.id(), op.id());
        assert_eq!(moved.range().start, Position::new(4, 1));
        assert_eq!(op.range().start, Position::new(3, 1));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(OperationKind::Insert.to_string(), "insert");
        assert_eq!(OperationKind::Undo.as_str(), "undo");
    }
}
