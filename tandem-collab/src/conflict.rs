//! Conflict detection and the per-file set of pending conflicts.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_core::{ChangeOperation, ConflictId, OperationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Unresolved,
    Resolved,
}

/// How a conflict gets settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local operation, discard the remote one.
    Local,
    /// Take the remote operation in place of the local one.
    Remote,
    /// Replace the contested region with caller-supplied text.
    Merge,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// Two concurrent operations on the same file that touch overlapping
/// ranges with different kinds.
///
/// `remote` is held back from the document until the conflict is settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub file_path: String,
    pub local: ChangeOperation,
    pub remote: ChangeOperation,
    pub state: ConflictState,
    pub resolution: Option<Resolution>,
    pub merged_content: Option<String>,
    pub detected_at: u64,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.state == ConflictState::Resolved
    }

    /// Whether this conflict is between exactly `a` and `b`, in any order.
    pub fn involves_pair(&self, a: OperationId, b: OperationId) -> bool {
        let (l, r) = (self.local.id(), self.remote.id());
        (l == a && r == b) || (l == b && r == a)
    }

    pub fn operation_ids(&self) -> [OperationId; 2] {
        [self.local.id(), self.remote.id()]
    }
}

/// Conflict between `local` and `remote`, if any.
///
/// Two operations conflict when they target the same file, their ranges
/// overlap (neither ends strictly before the other starts) and their kinds
/// differ. Same-kind overlaps are left to ordinary positioning.
pub fn detect_conflict(
    local: &ChangeOperation,
    remote: &ChangeOperation,
    detected_at: u64,
) -> Option<Conflict> {
    if local.file_path() != remote.file_path() {
        return None;
    }
    if !local.range().overlaps(&remote.range()) {
        return None;
    }
    if local.kind() == remote.kind() {
        return None;
    }

    Some(Conflict {
        id: Uuid::new_v4(),
        file_path: local.file_path().to_owned(),
        local: local.clone(),
        remote: remote.clone(),
        state: ConflictState::Unresolved,
        resolution: None,
        merged_content: None,
        detected_at,
    })
}

/// Pending and resolved conflicts for one file, keyed by id.
///
/// Lives inside the file replica, so every insert and removal happens
/// under the replica lock. Resolved conflicts are kept so late notices
/// about them can be reconciled, up to `max_resolved`; the oldest go first.
#[derive(Debug)]
pub struct ConflictSet {
    pending: HashMap<ConflictId, Conflict>,
    resolved: HashMap<ConflictId, Conflict>,
    resolved_order: VecDeque<ConflictId>,
    max_resolved: usize,
}

impl Default for ConflictSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictSet {
    pub const DEFAULT_MAX_RESOLVED: usize = 256;

    pub fn new() -> Self {
        Self::with_max_resolved(Self::DEFAULT_MAX_RESOLVED)
    }

    pub fn with_max_resolved(max_resolved: usize) -> Self {
        Self {
            pending: HashMap::new(),
            resolved: HashMap::new(),
            resolved_order: VecDeque::new(),
            max_resolved: max_resolved.max(1),
        }
    }

    pub fn insert(&mut self, conflict: Conflict) {
        self.pending.insert(conflict.id, conflict);
    }

    pub fn pending(&self, id: ConflictId) -> Option<&Conflict> {
        self.pending.get(&id)
    }

    pub fn resolved(&self, id: ConflictId) -> Option<&Conflict> {
        self.resolved.get(&id)
    }

    pub fn get(&self, id: ConflictId) -> Option<&Conflict> {
        self.pending.get(&id).or_else(|| self.resolved.get(&id))
    }

    pub fn is_pending(&self, id: ConflictId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Move a pending conflict to the resolved set. `None` if it was not
    /// pending, so a conflict can only be resolved once.
    pub fn mark_resolved(
        &mut self,
        id: ConflictId,
        resolution: Resolution,
        merged_content: Option<String>,
    ) -> Option<Conflict> {
        let mut conflict = self.pending.remove(&id)?;
        conflict.state = ConflictState::Resolved;
        conflict.resolution = Some(resolution);
        conflict.merged_content = merged_content;
        self.resolved.insert(id, conflict.clone());
        self.resolved_order.push_back(id);
        Some(conflict)
    }

    /// Forget the oldest resolved conflicts beyond `max_resolved`.
    /// Returns the ids that were dropped.
    pub fn prune_resolved(&mut self) -> Vec<ConflictId> {
        let mut dropped = Vec::new();
        while self.resolved_order.len() > self.max_resolved {
            if let Some(id) = self.resolved_order.pop_front() {
                self.resolved.remove(&id);
                dropped.push(id);
            }
        }
        dropped
    }

    /// Pending conflict whose two operations are both in `ids`.
    pub fn pending_for_pair(&self, ids: &[OperationId]) -> Option<ConflictId> {
        Self::find_pair(&self.pending, ids)
    }

    pub fn resolved_for_pair(&self, ids: &[OperationId]) -> Option<ConflictId> {
        Self::find_pair(&self.resolved, ids)
    }

    fn find_pair(map: &HashMap<ConflictId, Conflict>, ids: &[OperationId]) -> Option<ConflictId> {
        map.values()
            .find(|c| ids.contains(&c.local.id()) && ids.contains(&c.remote.id()))
            .map(|c| c.id)
    }

    /// Pending conflicts, oldest first.
    pub fn pending_list(&self) -> Vec<Conflict> {
        let mut list: Vec<Conflict> = self.pending.values().cloned().collect();
        list.sort_by_key(|c| (c.detected_at, c.id));
        list
    }

    /// Drop pending conflicts matching `pred`. Returns what was dropped.
    pub fn discard_pending<F>(&mut self, mut pred: F) -> Vec<Conflict>
    where
        F: FnMut(&Conflict) -> bool,
    {
        let ids: Vec<ConflictId> = self
            .pending
            .values()
            .filter(|c| pred(c))
            .map(|c| c.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{Position, TextRange, UserId};

    fn alice() -> UserId {
        Uuid::from_u128(1)
    }

    fn bob() -> UserId {
        Uuid::from_u128(2)
    }

    #[test]
    fn test_disjoint_lines_never_conflict() {
        let a = ChangeOperation::insert(alice(), "f", 1, Position::new(1, 1), "x");
        let b = ChangeOperation::delete(bob(), "f", 1, TextRange::from_coords(3, 1, 3, 4), "abc");
        assert!(detect_conflict(&a, &b, 0).is_none());
        assert!(detect_conflict(&b, &a, 0).is_none());
    }

    #[test]
    fn test_disjoint_same_line_never_conflict() {
        let a = ChangeOperation::delete(alice(), "f", 1, TextRange::from_coords(1, 1, 1, 3), "ab");
        let b = ChangeOperation::insert(bob(), "f", 1, Position::new(1, 6), "x");
        assert!(detect_conflict(&a, &b, 0).is_none());
    }

    #[test]
    fn test_overlap_with_different_kinds_conflicts() {
        let a = ChangeOperation::insert(alice(), "f", 1, Position::new(1, 1), "foo");
        let b = ChangeOperation::delete(bob(), "f", 1, TextRange::from_coords(1, 1, 1, 4), "abc");

        let conflict = detect_conflict(&a, &b, 42).unwrap();
        assert_eq!(conflict.local.id(), a.id());
        assert_eq!(conflict.remote.id(), b.id());
        assert_eq!(conflict.state, ConflictState::Unresolved);
        assert_eq!(conflict.detected_at, 42);
        assert!(conflict.involves_pair(b.id(), a.id()));
    }

    #[test]
    fn test_same_kind_overlap_is_not_a_conflict() {
        let a = ChangeOperation::delete(alice(), "f", 1, TextRange::from_coords(1, 1, 1, 4), "abc");
        let b = ChangeOperation::delete(bob(), "f", 1, TextRange::from_coords(1, 2, 1, 6), "bcde");
        assert!(detect_conflict(&a, &b, 0).is_none());
    }

    #[test]
    fn test_other_file_never_conflicts() {
        let a = ChangeOperation::insert(alice(), "a", 1, Position::START, "x");
        let b = ChangeOperation::delete(bob(), "b", 1, TextRange::from_coords(1, 1, 1, 2), "y");
        assert!(detect_conflict(&a, &b, 0).is_none());
    }

    #[test]
    fn test_resolution_is_monotonic() {
        let a = ChangeOperation::insert(alice(), "f", 1, Position::START, "x");
        let b = ChangeOperation::delete(bob(), "f", 1, TextRange::from_coords(1, 1, 1, 2), "y");
        let conflict = detect_conflict(&a, &b, 0).unwrap();
        let id = conflict.id;

        let mut set = ConflictSet::new();
        set.insert(conflict);
        assert!(set.is_pending(id));
        assert_eq!(set.pending_for_pair(&[a.id(), b.id()]), Some(id));

        let resolved = set.mark_resolved(id, Resolution::Local, None).unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(resolved.resolution, Some(Resolution::Local));

        assert!(set.mark_resolved(id, Resolution::Remote, None).is_none());
        assert_eq!(set.get(id).unwrap().resolution, Some(Resolution::Local));
        assert_eq!(set.resolved_for_pair(&[b.id(), a.id()]), Some(id));
        assert_eq!(set.pending_count(), 0);
        assert_eq!(set.resolved_count(), 1);
    }

    #[test]
    fn test_prune_keeps_newest_resolved() {
        let mut set = ConflictSet::with_max_resolved(2);
        let mut ids = Vec::new();
        for ts in 0..3 {
            let a = ChangeOperation::insert(alice(), "f", ts + 1, Position::START, "x");
            let b = ChangeOperation::delete(bob(), "f", ts + 1, TextRange::from_coords(1, 1, 1, 2), "y");
            let conflict = detect_conflict(&a, &b, ts).unwrap();
            ids.push(conflict.id);
            set.insert(conflict);
        }
        for id in &ids {
            set.mark_resolved(*id, Resolution::Local, None).unwrap();
        }
        assert_eq!(set.resolved_count(), 3);

        assert_eq!(set.prune_resolved(), vec![ids[0]]);
        assert_eq!(set.resolved_count(), 2);
        assert!(set.get(ids[0]).is_none());
        assert!(set.resolved(ids[2]).is_some());
        assert!(set.prune_resolved().is_empty());
    }

    #[test]
    fn test_discard_pending() {
        let mut set = ConflictSet::new();
        for ts in 0..3 {
            let a = ChangeOperation::insert(alice(), "f", ts + 1, Position::START, "x");
            let b = ChangeOperation::delete(bob(), "f", ts + 1, TextRange::from_coords(1, 1, 1, 2), "y");
            set.insert(detect_conflict(&a, &b, ts).unwrap());
        }
        let dropped = set.discard_pending(|c| c.detected_at < 2);
        assert_eq!(dropped.len(), 2);
        assert_eq!(set.pending_list().len(), 1);
    }
}
