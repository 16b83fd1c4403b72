//! Per-file operation history and the bookkeeping around it.
//!
//! - [`OperationLog`]: append-only, the source of truth for what happened
//! - [`AckWindow`]: local operations some peer has not acknowledged yet;
//!   remote operations are only checked for conflicts against these
//! - [`Outbox`]: local operations that could not be delivered

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use thiserror::Error;

use tandem_core::{ChangeOperation, OperationId, UserId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Operation {0} is already in the log")]
    Duplicate(OperationId),
    #[error("Operation from {author} has timestamp {got}, expected more than {last}")]
    OutOfOrder { author: UserId, last: u64, got: u64 },
    #[error("Operation targets {got}, log holds {expected}")]
    WrongFile { expected: String, got: String },
    #[error("Operation {0} is not in the log")]
    UnknownOperation(OperationId),
}

/// Append-only sequence of operations for one file.
///
/// Operations from one author must arrive with strictly increasing
/// timestamps; anything else is rejected rather than reordered.
#[derive(Debug, Clone)]
pub struct OperationLog {
    file_path: String,
    ops: Vec<ChangeOperation>,
    index: HashMap<OperationId, usize>,
    author_clock: HashMap<UserId, u64>,
}

impl OperationLog {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            ops: Vec::new(),
            index: HashMap::new(),
            author_clock: HashMap::new(),
        }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Validate `op` without appending it.
    pub fn check(&self, op: &ChangeOperation) -> Result<(), LogError> {
        if op.file_path() != self.file_path {
            return Err(LogError::WrongFile {
                expected: self.file_path.clone(),
                got: op.file_path().to_owned(),
            });
        }
        if self.index.contains_key(&op.id()) {
            return Err(LogError::Duplicate(op.id()));
        }
        if let Some(&last) = self.author_clock.get(&op.author()) {
            if op.timestamp() <= last {
                return Err(LogError::OutOfOrder {
                    author: op.author(),
                    last,
                    got: op.timestamp(),
                });
            }
        }
        Ok(())
    }

    /// Append `op`, returning its index.
    pub fn append(&mut self, op: ChangeOperation) -> Result<usize, LogError> {
        self.check(&op)?;
        let idx = self.ops.len();
        self.index.insert(op.id(), idx);
        self.author_clock.insert(op.author(), op.timestamp());
        self.ops.push(op);
        Ok(idx)
    }

    pub fn contains(&self, id: OperationId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: OperationId) -> Option<&ChangeOperation> {
        self.index.get(&id).map(|&idx| &self.ops[idx])
    }

    pub fn position(&self, id: OperationId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Operations appended after `after`, or the whole log for `None`.
    pub fn since(&self, after: Option<OperationId>) -> Result<&[ChangeOperation], LogError> {
        match after {
            None => Ok(&self.ops),
            Some(id) => {
                let idx = self.position(id).ok_or(LogError::UnknownOperation(id))?;
                Ok(&self.ops[idx + 1..])
            }
        }
    }

    /// Operations from index `idx` (exclusive) to the end.
    pub fn after_index(&self, idx: usize) -> &[ChangeOperation] {
        self.ops.get(idx + 1..).unwrap_or(&[])
    }

    /// Operations from the start through index `idx` (inclusive).
    pub fn through_index(&self, idx: usize) -> &[ChangeOperation] {
        &self.ops[..(idx + 1).min(self.ops.len())]
    }

    /// Operations from index `idx` (inclusive) to the end.
    pub fn from_index(&self, idx: usize) -> &[ChangeOperation] {
        self.ops.get(idx..).unwrap_or(&[])
    }

    pub fn last_timestamp(&self, author: UserId) -> Option<u64> {
        self.author_clock.get(&author).copied()
    }

    /// Highest timestamp seen per author.
    pub fn clock_snapshot(&self) -> HashMap<UserId, u64> {
        self.author_clock.clone()
    }

    pub fn last(&self) -> Option<&ChangeOperation> {
        self.ops.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeOperation> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl<'a> IntoIterator for &'a OperationLog {
    type Item = &'a ChangeOperation;
    type IntoIter = std::slice::Iter<'a, ChangeOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

#[derive(Debug, Clone)]
struct PendingAck {
    op: ChangeOperation,
    sent_at_ms: u64,
    awaiting: BTreeSet<UserId>,
    acked_by: HashSet<UserId>,
}

/// Local operations not yet acknowledged by every peer they were sent to.
#[derive(Debug, Clone)]
pub struct AckWindow {
    entries: VecDeque<PendingAck>,
    max_size: usize,
}

impl AckWindow {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Track `op` until every peer in `awaiting` acknowledges it.
    ///
    /// Returns the ids evicted to stay within `max_size`. With nobody to
    /// wait for the op is not tracked at all.
    pub fn push(
        &mut self,
        op: ChangeOperation,
        awaiting: impl IntoIterator<Item = UserId>,
        now_ms: u64,
    ) -> Vec<OperationId> {
        let awaiting: BTreeSet<UserId> = awaiting.into_iter().collect();
        if awaiting.is_empty() {
            return Vec::new();
        }
        self.entries.push_back(PendingAck {
            op,
            sent_at_ms: now_ms,
            awaiting,
            acked_by: HashSet::new(),
        });

        let mut evicted = Vec::new();
        while self.entries.len() > self.max_size {
            if let Some(old) = self.entries.pop_front() {
                evicted.push(old.op.id());
            }
        }
        evicted
    }

    /// Record that `peer` has applied `id`. Returns true once the op is
    /// fully acknowledged and has left the window.
    pub fn ack(&mut self, id: OperationId, peer: UserId) -> bool {
        let Some(idx) = self.entries.iter().position(|e| e.op.id() == id) else {
            return false;
        };
        let entry = &mut self.entries[idx];
        entry.acked_by.insert(peer);
        if entry.awaiting.iter().all(|p| entry.acked_by.contains(p)) {
            self.entries.remove(idx);
            return true;
        }
        false
    }

    /// Local operations `peer` had not acknowledged, oldest first.
    pub fn unacked_by(&self, peer: UserId) -> impl Iterator<Item = &ChangeOperation> {
        self.entries
            .iter()
            .filter(move |e| !e.acked_by.contains(&peer))
            .map(|e| &e.op)
    }

    /// Stop waiting on `peer` (it left). Returns ids that became complete.
    pub fn forget_peer(&mut self, peer: UserId) -> Vec<OperationId> {
        let mut done = Vec::new();
        self.entries.retain_mut(|e| {
            e.awaiting.remove(&peer);
            let complete = e.awaiting.iter().all(|p| e.acked_by.contains(p));
            if complete {
                done.push(e.op.id());
            }
            !complete
        });
        done
    }

    /// Drop entries older than `timeout_ms`. Returns the dropped ids.
    pub fn expire(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<OperationId> {
        let mut expired = Vec::new();
        self.entries.retain(|e| {
            let keep = now_ms.saturating_sub(e.sent_at_ms) <= timeout_ms;
            if !keep {
                expired.push(e.op.id());
            }
            keep
        });
        expired
    }

    pub fn remove(&mut self, id: OperationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.op.id() != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Local operations waiting for delivery.
///
/// Once anything is buffered, later operations queue behind it so peers
/// still see each author's operations in order.
#[derive(Debug, Clone)]
pub struct Outbox {
    queue: VecDeque<ChangeOperation>,
    max_size: usize,
}

impl Outbox {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Buffer `op`. Returns false when full.
    pub fn enqueue(&mut self, op: ChangeOperation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        if self.queue.iter().any(|queued| queued.id() == op.id()) {
            return true;
        }
        self.queue.push_back(op);
        true
    }

    /// Copy of everything buffered, oldest first.
    pub fn snapshot(&self) -> Vec<ChangeOperation> {
        self.queue.iter().cloned().collect()
    }

    /// Remove the given ids after a successful flush.
    pub fn remove_delivered(&mut self, delivered: &[OperationId]) -> usize {
        let before = self.queue.len();
        self.queue.retain(|op| !delivered.contains(&op.id()));
        before - self.queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
