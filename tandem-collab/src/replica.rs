//! One file as seen by one collaborator.
//!
//! A [`FileReplica`] owns the live document and everything needed to keep
//! it consistent with peers: the operation log, the ack window of local
//! operations, the outbox, and the conflicts found against remote
//! operations. Every mutation goes through `log.check` → `document.apply`
//! → `log.append`, and the log stores operations exactly as they were
//! applied, so replaying it over the base always reproduces the document.
//!
//! Replicas live behind one mutex each in a [`ReplicaStore`]; callers never
//! hold that mutex across a transport call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use tandem_core::{
    replay, ChangeOperation, ConflictId, DocumentError, LamportClock, OperationId, OperationKind,
    Position, SessionId, TextDocument, TextRange, UserId,
};

use crate::config::CollabConfig;
use crate::conflict::{detect_conflict, Conflict, ConflictSet, Resolution};
use crate::error::CollabError;
use crate::oplog::{AckWindow, OperationLog, Outbox};
use crate::resolver;
use crate::session::EditingSession;

/// What happened to a remote operation or resolution notice.
#[derive(Debug, Clone, PartialEq)]
pub enum Integration {
    /// Applied to the document, positioned as given.
    Applied(ChangeOperation),
    /// Held back: it conflicts with a local operation.
    Conflicted(Conflict),
    /// Settled a pending conflict the way a peer already settled it.
    /// `operation` is what changed the document, if anything did.
    Adopted {
        conflict: Conflict,
        operation: Option<ChangeOperation>,
    },
    /// Already known, discarded, or superseded.
    Ignored,
}

/// Result of settling a conflict locally.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// Local side kept; peers are told which operation won.
    Notice {
        conflict: Conflict,
        winner: OperationId,
        loser: OperationId,
        timestamp: u64,
    },
    /// A correcting operation was applied and must be broadcast.
    Correction {
        conflict: Conflict,
        operation: ChangeOperation,
    },
}

impl ResolveOutcome {
    pub fn conflict(&self) -> &Conflict {
        match self {
            ResolveOutcome::Notice { conflict, .. } | ResolveOutcome::Correction { conflict, .. } => {
                conflict
            }
        }
    }
}

/// How a resolved conflict left the document, for reconciling later
/// corrections and notices about the same pair.
#[derive(Debug, Clone)]
struct Settlement {
    region: TextRange,
    /// Log length when `region` was recorded.
    log_len: usize,
    pre_text: String,
    origin: Position,
    precedence: (u64, UserId),
}

pub struct FileReplica {
    session_id: SessionId,
    file_path: String,
    local: UserId,
    base: String,
    document: TextDocument,
    log: OperationLog,
    window: AckWindow,
    outbox: Outbox,
    conflicts: ConflictSet,
    settlements: HashMap<ConflictId, Settlement>,
    /// Dropped operations and the conflict that dropped them.
    discarded: HashMap<OperationId, ConflictId>,
    clock: LamportClock,
    pulled: HashMap<UserId, OperationId>,
    undo_stack: Vec<OperationId>,
    redo_stack: Vec<OperationId>,
}

impl FileReplica {
    pub fn new(session: &EditingSession, local: UserId, config: &CollabConfig) -> Self {
        Self {
            session_id: session.id,
            file_path: session.file_path.clone(),
            local,
            base: session.base_content.clone(),
            document: TextDocument::from_text(&session.base_content),
            log: OperationLog::new(session.file_path.clone()),
            window: AckWindow::new(config.max_pending_window),
            outbox: Outbox::new(config.outbox_capacity),
            conflicts: ConflictSet::with_max_resolved(config.max_resolved_conflicts),
            settlements: HashMap::new(),
            discarded: HashMap::new(),
            clock: LamportClock::new(),
            pulled: HashMap::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn text(&self) -> String {
        self.document.text()
    }

    pub fn document(&self) -> &TextDocument {
        &self.document
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn slice(&self, range: TextRange) -> Result<String, CollabError> {
        Ok(self.document.slice(range)?)
    }

    /// Lamport time for the next local operation.
    pub fn next_timestamp(&mut self) -> u64 {
        self.clock.tick()
    }

    /// Whether `id` is in the log or was dropped by a resolution.
    pub fn knows(&self, id: OperationId) -> bool {
        self.log.contains(id) || self.discarded.contains_key(&id)
    }

    fn commit(&mut self, op: ChangeOperation) -> Result<ChangeOperation, CollabError> {
        self.log.check(&op)?;
        self.document.apply(&op)?;
        self.log.append(op.clone())?;
        Ok(op)
    }

    fn track(&mut self, op: &ChangeOperation, awaiting: &[UserId], now_ms: u64) {
        let evicted = self.window.push(op.clone(), awaiting.iter().copied(), now_ms);
        if !evicted.is_empty() {
            log::debug!(
                "Ack window for {} full, evicted {} operations",
                self.file_path,
                evicted.len()
            );
        }
    }

    /// Apply a local operation and start waiting for `awaiting` to ack it.
    pub fn apply_local(
        &mut self,
        op: ChangeOperation,
        awaiting: &[UserId],
        now_ms: u64,
    ) -> Result<ChangeOperation, CollabError> {
        self.clock.observe(op.timestamp());
        let op = self.commit(op)?;
        self.track(&op, awaiting, now_ms);
        match op.kind() {
            OperationKind::Undo => self.redo_stack.push(op.id()),
            OperationKind::Redo => self.undo_stack.push(op.id()),
            _ if !op.is_correction() => {
                self.undo_stack.push(op.id());
                self.redo_stack.clear();
            }
            _ => {}
        }
        log::debug!("Applied local {} {} to {}", op.kind(), op.id(), self.file_path);
        Ok(op)
    }

    /// Undo the most recent local edit that has not been undone.
    ///
    /// Returns `None` when there is nothing to undo.
    pub fn undo(&mut self, awaiting: &[UserId], now_ms: u64) -> Result<Option<ChangeOperation>, CollabError> {
        let Some(target_id) = self.undo_stack.pop() else {
            return Ok(None);
        };
        let op = match self.inverse_of(target_id, true) {
            Ok(op) => op,
            Err(e) => {
                self.undo_stack.push(target_id);
                return Err(e);
            }
        };
        self.apply_local(op, awaiting, now_ms).map(Some)
    }

    /// Re-apply the most recent undo. Returns `None` when there is nothing
    /// to redo.
    pub fn redo(&mut self, awaiting: &[UserId], now_ms: u64) -> Result<Option<ChangeOperation>, CollabError> {
        let Some(undo_id) = self.redo_stack.pop() else {
            return Ok(None);
        };
        let op = match self.inverse_of(undo_id, false) {
            Ok(op) => op,
            Err(e) => {
                self.redo_stack.push(undo_id);
                return Err(e);
            }
        };
        self.apply_local(op, awaiting, now_ms).map(Some)
    }

    /// Inverse of a logged operation, positioned past everything logged
    /// after it.
    fn inverse_of(&mut self, id: OperationId, undo: bool) -> Result<ChangeOperation, CollabError> {
        let idx = self
            .log
            .position(id)
            .ok_or_else(|| CollabError::stale(id, "operation is no longer in the log"))?;
        let target = self.log.from_index(idx)[0].clone();
        let span = carry_span(target.post_range(), self.log.after_index(idx))
            .ok_or_else(|| CollabError::stale(id, "text was changed by a later edit"))?;
        let ts = self.clock.tick();
        let op = if undo {
            ChangeOperation::undo(self.local, ts, &target)
        } else {
            ChangeOperation::redo(self.local, ts, &target)
        };
        Ok(op.rebased(span))
    }

    /// Integrate an operation from a peer.
    ///
    /// `coordinate_author` is the peer whose document `op`'s range refers
    /// to: the author for direct delivery, the responder for pulled
    /// operations. The op is checked against, then positioned past, each
    /// local operation that peer had not acknowledged.
    pub fn integrate_remote(
        &mut self,
        op: ChangeOperation,
        coordinate_author: UserId,
        now_ms: u64,
    ) -> Result<Integration, CollabError> {
        if self.knows(op.id()) {
            log::trace!("Ignored known operation {}", op.id());
            return Ok(Integration::Ignored);
        }
        if op.range().is_inverted() {
            return Err(DocumentError::InvertedRange { range: op.range() }.into());
        }
        self.clock.observe(op.timestamp());

        if op.is_correction() {
            if let Some(result) = self.integrate_correction(&op)? {
                return Ok(result);
            }
        }

        let concurrent: Vec<ChangeOperation> = self.window.unacked_by(coordinate_author).cloned().collect();
        let mut range = op.range();
        for local in &concurrent {
            if let Some(conflict) = detect_conflict(local, &op.rebased(range), now_ms) {
                log::info!(
                    "Conflict {} on {}: local {} {} vs remote {} {}",
                    conflict.id,
                    self.file_path,
                    local.kind(),
                    local.id(),
                    op.kind(),
                    op.id()
                );
                self.conflicts.insert(conflict.clone());
                return Ok(Integration::Conflicted(conflict));
            }
            range = transform(local, &op, range);
        }

        let op = self.commit(op.rebased(range))?;
        log::debug!("Applied remote {} {} from {}", op.kind(), op.id(), op.author());
        Ok(Integration::Applied(op))
    }

    /// Corrections for a pair we know about. `None` means the pair is not
    /// known here and the op goes through the ordinary path.
    fn integrate_correction(&mut self, op: &ChangeOperation) -> Result<Option<Integration>, CollabError> {
        if let Some(id) = self.conflicts.pending_for_pair(op.supersedes()) {
            let Some(conflict) = self.conflicts.pending(id).cloned() else {
                return Ok(None);
            };
            let plan = match resolver::plan(&self.base, &self.document, &self.log, &conflict) {
                Ok(plan) => plan,
                Err(e) => {
                    log::warn!("Cannot adopt correction {} for conflict {id}: {e}", op.id());
                    return Ok(None);
                }
            };
            let applied = self.commit(op.rebased(plan.region))?;
            let resolved = self.settle(
                &conflict,
                Resolution::Merge,
                Some(applied.text().to_owned()),
                Settlement {
                    region: applied.post_range(),
                    log_len: self.log.len(),
                    pre_text: plan.pre_text,
                    origin: plan.origin,
                    precedence: op.precedence(),
                },
            );
            log::info!("Adopted correction {} for conflict {id}", op.id());
            return Ok(Some(Integration::Adopted {
                conflict: resolved,
                operation: Some(applied),
            }));
        }

        if let Some(id) = self.conflicts.resolved_for_pair(op.supersedes()) {
            let result = self.reconcile(id, op.text(), op.precedence(), Some(op))?;
            if result == Integration::Ignored {
                self.discarded.insert(op.id(), id);
            }
            return Ok(Some(result));
        }

        log::debug!("Correction {} names a pair unknown here, applying as an edit", op.id());
        Ok(None)
    }

    /// A peer kept `winner` and dropped `loser` without a new operation.
    pub fn integrate_resolution(
        &mut self,
        sender: UserId,
        winner: OperationId,
        loser: OperationId,
        timestamp: u64,
    ) -> Result<Integration, CollabError> {
        self.clock.observe(timestamp);
        let pair = [winner, loser];

        if let Some(id) = self.conflicts.pending_for_pair(&pair) {
            let Some(conflict) = self.conflicts.pending(id).cloned() else {
                return Ok(Integration::Ignored);
            };
            let plan = resolver::plan(&self.base, &self.document, &self.log, &conflict)?;
            let (resolution, kept) = if winner == conflict.local.id() {
                (Resolution::Local, &conflict.local)
            } else {
                (Resolution::Remote, &conflict.remote)
            };
            let desired = resolver::apply_relative(&plan.pre_text, plan.origin, kept)?;

            let mut region = plan.region;
            let mut operation = None;
            if desired != plan.current_text {
                let ts = self.clock.tick();
                let op = ChangeOperation::correction(
                    self.local,
                    self.file_path.clone(),
                    ts,
                    plan.region,
                    desired,
                    plan.current_text.clone(),
                    vec![conflict.local.id(), conflict.remote.id()],
                );
                let op = self.commit(op)?;
                region = op.post_range();
                operation = Some(op);
            }
            let resolved = self.settle(
                &conflict,
                resolution,
                None,
                Settlement {
                    region,
                    log_len: self.log.len(),
                    pre_text: plan.pre_text,
                    origin: plan.origin,
                    precedence: (timestamp, sender),
                },
            );
            log::info!("Adopted {resolution} resolution of conflict {id} from {sender}");
            return Ok(Integration::Adopted {
                conflict: resolved,
                operation,
            });
        }

        if let Some(id) = self.conflicts.resolved_for_pair(&pair) {
            let Some(conflict) = self.conflicts.resolved(id).cloned() else {
                return Ok(Integration::Ignored);
            };
            let Some(settlement) = self.settlements.get(&id) else {
                return Ok(Integration::Ignored);
            };
            let kept = if winner == conflict.local.id() {
                &conflict.local
            } else {
                &conflict.remote
            };
            let desired = resolver::apply_relative(&settlement.pre_text, settlement.origin, kept)?;
            return self.reconcile(id, &desired, (timestamp, sender), None);
        }

        log::debug!("Resolution notice from {sender} names a pair unknown here");
        Ok(Integration::Ignored)
    }

    /// Bring an already settled region in line with a competing settlement
    /// of the same conflict. The higher precedence wins on every replica.
    fn reconcile(
        &mut self,
        id: ConflictId,
        desired: &str,
        precedence: (u64, UserId),
        incoming: Option<&ChangeOperation>,
    ) -> Result<Integration, CollabError> {
        let Some(settlement) = self.settlements.get(&id).cloned() else {
            return Ok(Integration::Ignored);
        };
        let region = resolver::widen_through(settlement.region, self.log.from_index(settlement.log_len));
        let current = self.document.slice(region)?;
        if current == desired {
            return Ok(Integration::Ignored);
        }
        if precedence <= settlement.precedence {
            log::debug!("Kept own resolution of conflict {id} over lower-precedence one");
            return Ok(Integration::Ignored);
        }

        let op = match incoming {
            Some(op) => op.rebased(region),
            None => {
                let ids = self
                    .conflicts
                    .resolved(id)
                    .map(|c| vec![c.local.id(), c.remote.id()])
                    .unwrap_or_default();
                let ts = self.clock.tick();
                ChangeOperation::correction(self.local, self.file_path.clone(), ts, region, desired, current, ids)
            }
        };
        let op = self.commit(op)?;
        self.settlements.insert(
            id,
            Settlement {
                region: op.post_range(),
                log_len: self.log.len(),
                precedence,
                ..settlement
            },
        );
        log::info!("Replaced resolution of conflict {id} with higher-precedence one");
        Ok(Integration::Applied(op))
    }

    /// Mark `conflict` resolved and drop the operation that lost.
    ///
    /// Only the newest resolved conflicts are remembered; everything kept
    /// for an older one is forgotten with it.
    fn settle(
        &mut self,
        conflict: &Conflict,
        resolution: Resolution,
        merged_content: Option<String>,
        settlement: Settlement,
    ) -> Conflict {
        self.discarded.insert(conflict.remote.id(), conflict.id);
        self.window.remove(conflict.local.id());
        self.settlements.insert(conflict.id, settlement);
        let resolved = self
            .conflicts
            .mark_resolved(conflict.id, resolution, merged_content)
            .unwrap_or_else(|| conflict.clone());

        let forgotten = self.conflicts.prune_resolved();
        if !forgotten.is_empty() {
            for id in &forgotten {
                self.settlements.remove(id);
            }
            self.discarded.retain(|_, id| !forgotten.contains(id));
            log::debug!(
                "Forgot {} resolved conflicts on {}",
                forgotten.len(),
                self.file_path
            );
        }
        resolved
    }

    pub fn resolved_count(&self) -> usize {
        self.conflicts.resolved_count()
    }

    /// Settle a pending conflict.
    ///
    /// Nothing changes on error: an unknown or already resolved id, a merge
    /// without content, or a local operation no longer in the log. Edits
    /// made inside the region since detection are overwritten, so keeping
    /// the local side then needs a correction too.
    pub fn resolve(
        &mut self,
        id: ConflictId,
        resolution: Resolution,
        merged_content: Option<String>,
        awaiting: &[UserId],
        now_ms: u64,
    ) -> Result<ResolveOutcome, CollabError> {
        if self.conflicts.resolved(id).is_some() {
            return Err(CollabError::AlreadyResolved(id));
        }
        let conflict = self
            .conflicts
            .pending(id)
            .cloned()
            .ok_or(CollabError::ConflictNotFound(id))?;
        let plan = resolver::plan(&self.base, &self.document, &self.log, &conflict)?;
        let text = resolver::resolution_text(&plan, &conflict, resolution, merged_content.as_deref())?;

        if resolution == Resolution::Local && text == plan.current_text {
            let timestamp = self.clock.tick();
            let resolved = self.settle(
                &conflict,
                resolution,
                None,
                Settlement {
                    region: plan.region,
                    log_len: self.log.len(),
                    pre_text: plan.pre_text,
                    origin: plan.origin,
                    precedence: (timestamp, self.local),
                },
            );
            log::info!("Resolved conflict {id} keeping local operation");
            return Ok(ResolveOutcome::Notice {
                winner: conflict.local.id(),
                loser: conflict.remote.id(),
                timestamp,
                conflict: resolved,
            });
        }

        let ts = self.clock.tick();
        let op = ChangeOperation::correction(
            self.local,
            self.file_path.clone(),
            ts,
            plan.region,
            text,
            plan.current_text,
            vec![conflict.local.id(), conflict.remote.id()],
        );
        let op = self.commit(op)?;
        let resolved = self.settle(
            &conflict,
            resolution,
            merged_content,
            Settlement {
                region: op.post_range(),
                log_len: self.log.len(),
                pre_text: plan.pre_text,
                origin: plan.origin,
                precedence: op.precedence(),
            },
        );
        self.track(&op, awaiting, now_ms);
        log::info!("Resolved conflict {id} as {resolution} with {}", op.id());
        Ok(ResolveOutcome::Correction {
            conflict: resolved,
            operation: op,
        })
    }

    /// Integrate a pulled batch in the responder's log order.
    ///
    /// Our own operations in the batch tell us the responder has them.
    /// Failures are logged and skipped so one bad op does not stall the
    /// rest.
    pub fn integrate_pulled(
        &mut self,
        responder: UserId,
        ops: Vec<ChangeOperation>,
        now_ms: u64,
    ) -> Vec<Integration> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            if op.author() == self.local {
                self.window.ack(op.id(), responder);
                continue;
            }
            match self.integrate_remote(op, responder, now_ms) {
                Ok(Integration::Ignored) => {}
                Ok(result) => results.push(result),
                Err(e) => log::warn!("Skipped pulled operation from {responder}: {e}"),
            }
        }
        results
    }

    /// Operations for a peer's pull request.
    ///
    /// Everything after `after` in log order, minus other authors'
    /// operations the requester already has according to `seen`. The
    /// requester's own operations stay in as position markers. An unknown
    /// `after` falls back to the whole log.
    pub fn serve_pull(
        &self,
        requester: UserId,
        after: Option<OperationId>,
        seen: &HashMap<UserId, u64>,
    ) -> Vec<ChangeOperation> {
        let ops = match self.log.since(after) {
            Ok(ops) => ops,
            Err(e) => {
                log::warn!("Pull from {requester} on {}: {e}, sending full log", self.file_path);
                self.log.from_index(0)
            }
        };
        ops.iter()
            .filter(|op| {
                op.author() == requester
                    || seen.get(&op.author()).is_none_or(|&last| op.timestamp() > last)
            })
            .cloned()
            .collect()
    }

    /// Record that `peer` applied `id`.
    pub fn ack(&mut self, id: OperationId, peer: UserId) -> bool {
        self.window.ack(id, peer)
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Drop window entries past `timeout_ms`.
    pub fn expire_window(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<OperationId> {
        let expired = self.window.expire(now_ms, timeout_ms);
        if !expired.is_empty() {
            log::warn!(
                "{} operations on {} were not acknowledged within {timeout_ms}ms",
                expired.len(),
                self.file_path
            );
        }
        expired
    }

    /// `peer` left: stop waiting for it and drop conflicts with its ops.
    pub fn forget_peer(&mut self, peer: UserId) -> Vec<Conflict> {
        self.window.forget_peer(peer);
        self.conflicts.discard_pending(|c| c.remote.author() == peer)
    }

    /// We left or the session ended: stop tracking anything pending.
    pub fn clear_pending(&mut self) -> Vec<Conflict> {
        self.window.clear();
        self.conflicts.discard_pending(|_| true)
    }

    pub fn conflict(&self, id: ConflictId) -> Option<&Conflict> {
        self.conflicts.get(id)
    }

    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        self.conflicts.pending_list()
    }

    /// Buffer an undelivered local operation. False when the outbox is full.
    pub fn enqueue_outbox(&mut self, op: ChangeOperation) -> bool {
        self.outbox.enqueue(op)
    }

    pub fn outbox_is_empty(&self) -> bool {
        self.outbox.is_empty()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn outbox_snapshot(&self) -> Vec<ChangeOperation> {
        self.outbox.snapshot()
    }

    pub fn remove_delivered(&mut self, ids: &[OperationId]) -> usize {
        self.outbox.remove_delivered(ids)
    }

    pub fn pulled_from(&self, peer: UserId) -> Option<OperationId> {
        self.pulled.get(&peer).copied()
    }

    pub fn set_pulled(&mut self, peer: UserId, last: OperationId) {
        self.pulled.insert(peer, last);
    }

    /// Per-author clock sent with pull requests.
    pub fn seen_clock(&self) -> HashMap<UserId, u64> {
        self.log.clock_snapshot()
    }

    /// Replay base + log. On divergence the replayed text replaces the
    /// live document.
    pub fn sync(&mut self) -> Result<String, CollabError> {
        let replayed = replay(&self.base, &self.log)?;
        let text = replayed.text();
        if text != self.document.text() {
            log::error!(
                "Document {} diverged from its log ({} operations), restoring replayed content",
                self.file_path,
                self.log.len()
            );
            self.document = replayed;
        }
        Ok(text)
    }
}

/// Position `remote`'s `range` past the concurrent, non-conflicting
/// `local` operation. Inserts at the same point are ordered by author id,
/// the lower id first.
fn transform(local: &ChangeOperation, remote: &ChangeOperation, range: TextRange) -> TextRange {
    let same_point = local.kind() == OperationKind::Insert
        && remote.kind() == OperationKind::Insert
        && local.range().start == range.start;
    if same_point {
        if local.author() < remote.author() {
            return TextRange::point(local.post_range().end);
        }
        return range;
    }
    local.edit().map_range(range)
}

/// Follow `span` through `later` operations for undo and redo. `None` if
/// one of them edited inside it. Text typed right at the end of the span
/// stays outside it.
fn carry_span(mut span: TextRange, later: &[ChangeOperation]) -> Option<TextRange> {
    for op in later {
        let edited = op.range();
        let inside = if edited.is_empty() {
            span.start < edited.start && edited.start < span.end
        } else {
            edited.start < span.end && span.start < edited.end
        };
        if inside {
            return None;
        }
        let edit = op.edit();
        let start = edit.map_position(span.start);
        let end = if edited.is_empty() && edited.start == span.end && !span.is_empty() {
            span.end
        } else {
            edit.map_position(span.end)
        };
        span = TextRange::new(start, end);
    }
    Some(span)
}

/// Replicas of every file this collaborator has open.
pub struct ReplicaStore {
    replicas: RwLock<HashMap<String, Arc<Mutex<FileReplica>>>>,
}

impl Default for ReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self {
            replicas: RwLock::new(HashMap::new()),
        }
    }

    /// Replica for `session`'s file, opened from the session's base
    /// content if needed.
    pub async fn get_or_open(
        &self,
        session: &EditingSession,
        local: UserId,
        config: &CollabConfig,
    ) -> Arc<Mutex<FileReplica>> {
        {
            let replicas = self.replicas.read().await;
            if let Some(replica) = replicas.get(&session.file_path) {
                return replica.clone();
            }
        }

        let mut replicas = self.replicas.write().await;
        if let Some(replica) = replicas.get(&session.file_path) {
            return replica.clone();
        }
        log::debug!("Opened replica of {} for session {}", session.file_path, session.id);
        let replica = Arc::new(Mutex::new(FileReplica::new(session, local, config)));
        replicas.insert(session.file_path.clone(), replica.clone());
        replica
    }

    pub async fn get(&self, file_path: &str) -> Option<Arc<Mutex<FileReplica>>> {
        self.replicas.read().await.get(file_path).cloned()
    }

    pub async fn close(&self, file_path: &str) -> Option<Arc<Mutex<FileReplica>>> {
        let closed = self.replicas.write().await.remove(file_path);
        if closed.is_some() {
            log::debug!("Closed replica of {file_path}");
        }
        closed
    }

    pub async fn all(&self) -> Vec<Arc<Mutex<FileReplica>>> {
        self.replicas.read().await.values().cloned().collect()
    }

    pub async fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.replicas.read().await.keys().cloned().collect();
        files.sort();
        files
    }
}
