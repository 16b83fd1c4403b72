//! One user's collaboration endpoint.
//!
//! [`Collaborator`] ties sessions, replicas, presence and sync together.
//! Local calls apply to the replica first and then go out over the
//! [`Transport`]; inbound traffic arrives through the [`MessageHandler`]
//! implementation.
//!
//! ```text
//!   insert / delete / replace / undo
//!            │
//!            ▼
//!   FileReplica::apply_local ──► Payload::Change ──► peers
//!            ▲                                         │
//!            │                                         ▼
//!   handle_message ◄── Payload::Ack ◄── FileReplica::integrate_remote
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};

use tandem_core::{
    ChangeOperation, ConflictId, OperationId, Position, SessionId, TextRange, UserId,
};

use crate::config::CollabConfig;
use crate::conflict::{Conflict, Resolution};
use crate::error::CollabError;
use crate::events::{
    ChangeEvent, ChangeOrigin, ConflictNotice, EventHub, SessionEvent, SessionEventKind,
};
use crate::presence::{PresenceTracker, PresenceUpdate, UserPresence};
use crate::protocol::{Envelope, OperationBatch, Payload};
use crate::replica::{FileReplica, Integration, ReplicaStore, ResolveOutcome};
use crate::resolver;
use crate::room::{ConflictPolicy, RoomDirectory};
use crate::session::{EditingSession, Permission, SessionManager, UserProfile};
use crate::sync::SyncCoordinator;
use crate::transport::{MessageHandler, Transport};

pub struct Collaborator {
    profile: UserProfile,
    config: CollabConfig,
    transport: Arc<dyn Transport>,
    events: Arc<EventHub>,
    sessions: SessionManager,
    presence: RwLock<PresenceTracker>,
    replicas: ReplicaStore,
    rooms: Arc<RoomDirectory>,
    sync: SyncCoordinator,
    documents: RwLock<HashMap<String, String>>,
}

impl Collaborator {
    pub fn new(
        profile: UserProfile,
        config: CollabConfig,
        transport: Arc<dyn Transport>,
        rooms: Arc<RoomDirectory>,
    ) -> Arc<Self> {
        let events = Arc::new(EventHub::new(config.event_capacity));
        let sessions = SessionManager::new(
            profile.clone(),
            config.default_permission,
            rooms.clone(),
            transport.clone(),
            events.clone(),
        );
        let presence = PresenceTracker::new(
            profile.id,
            profile.display_name.clone(),
            std::time::Duration::from_millis(config.cursor_broadcast_interval_ms),
            config.away_after_ms,
            config.offline_after_ms,
            crate::now_ms(),
        );
        log::info!("Collaborator {} ({}) ready", profile.display_name, profile.id);
        Arc::new(Self {
            sync: SyncCoordinator::new(profile.id, transport.clone()),
            profile,
            config,
            transport,
            events,
            sessions,
            presence: RwLock::new(presence),
            replicas: ReplicaStore::new(),
            rooms,
            documents: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> UserId {
        self.profile.id
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomDirectory> {
        &self.rooms
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe_changes()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<UserPresence> {
        self.events.subscribe_presence()
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictNotice> {
        self.events.subscribe_conflicts()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe_sessions()
    }

    // ---- sessions ----

    /// Make `profile` a known user, so sessions can name them.
    pub async fn register_user(&self, profile: UserProfile) {
        self.sessions.register_user(profile).await;
    }

    /// Content a session started on `file_path` begins from.
    pub async fn open_document(&self, file_path: &str, content: &str) {
        self.documents
            .write()
            .await
            .insert(file_path.to_owned(), content.to_owned());
    }

    pub async fn start_session(
        &self,
        file_path: &str,
        participants: &[UserId],
    ) -> Result<EditingSession, CollabError> {
        let base = self
            .documents
            .read()
            .await
            .get(file_path)
            .cloned()
            .unwrap_or_default();
        let session = self.sessions.start_session(file_path, &base, participants).await?;
        self.replicas
            .get_or_open(&session, self.id(), &self.config)
            .await;
        self.update_presence(PresenceUpdate::file(file_path)).await;
        Ok(session)
    }

    /// Join a session and catch up on what happened before.
    pub async fn join_session(&self, session_id: SessionId) -> Result<EditingSession, CollabError> {
        let session = self.sessions.join_session(session_id).await?;
        self.replicas
            .get_or_open(&session, self.id(), &self.config)
            .await;
        self.update_presence(PresenceUpdate::file(session.file_path.clone()))
            .await;
        if !session.others(self.id()).is_empty() {
            if let Err(e) = self.catch_up(&session.file_path).await {
                log::warn!("Catch-up on join of {session_id} failed: {e}");
            }
        }
        Ok(session)
    }

    /// Leave a session. Pending local state for the file is dropped and
    /// peers see us leave the file.
    pub async fn leave_session(&self, session_id: SessionId) -> Result<(), CollabError> {
        let before = self.sessions.leave_session(session_id).await?;
        let recipients = before.others(self.id());
        self.close_replica(&before.file_path).await;

        let left = self
            .presence
            .write()
            .await
            .leave_file(self.id(), &before.file_path, crate::now_ms());
        if let Some(presence) = left {
            self.events.publish_presence(presence.clone());
            self.send_best_effort(recipients, Payload::Presence(presence))
                .await;
        }
        Ok(())
    }

    /// Admin-only: end the session for everyone.
    pub async fn end_session(&self, session_id: SessionId) -> Result<EditingSession, CollabError> {
        let ended = self.sessions.end_session(session_id).await?;
        self.close_replica(&ended.file_path).await;
        let left = self
            .presence
            .write()
            .await
            .leave_file(self.id(), &ended.file_path, crate::now_ms());
        if let Some(presence) = left {
            self.events.publish_presence(presence.clone());
            self.send_best_effort(ended.others(self.id()), Payload::Presence(presence))
                .await;
        }
        Ok(ended)
    }

    pub async fn grant_permission(
        &self,
        session_id: SessionId,
        user: UserId,
        permission: Permission,
    ) -> Result<EditingSession, CollabError> {
        self.sessions
            .grant_permission(session_id, user, permission)
            .await
    }

    pub async fn session(&self, session_id: SessionId) -> Option<EditingSession> {
        self.sessions.session(session_id).await
    }

    pub async fn session_for_file(&self, file_path: &str) -> Option<EditingSession> {
        self.sessions.session_for_file(file_path).await
    }

    pub async fn active_sessions(&self) -> Vec<EditingSession> {
        self.sessions.active_sessions().await
    }

    async fn close_replica(&self, file_path: &str) {
        if let Some(replica) = self.replicas.close(file_path).await {
            let dropped = replica.lock().await.clear_pending();
            if !dropped.is_empty() {
                log::info!("Dropped {} pending conflicts on {file_path}", dropped.len());
            }
        }
    }

    // ---- editing ----

    /// Active session on `file_path` in which we may write, and its replica.
    async fn writable(&self, file_path: &str) -> Result<(EditingSession, Arc<Mutex<FileReplica>>), CollabError> {
        let session = self
            .sessions
            .session_for_file(file_path)
            .await
            .ok_or_else(|| CollabError::NoSessionForFile(file_path.to_owned()))?;
        let session = self
            .sessions
            .require_permission(session.id, self.id(), Permission::Write)
            .await?;
        let replica = self
            .replicas
            .get_or_open(&session, self.id(), &self.config)
            .await;
        Ok((session, replica))
    }

    async fn local_edit<F>(&self, file_path: &str, build: F) -> Result<Option<ChangeOperation>, CollabError>
    where
        F: FnOnce(&mut FileReplica, &[UserId], u64) -> Result<Option<ChangeOperation>, CollabError> + Send,
    {
        let (session, replica) = self.writable(file_path).await?;
        let others = session.others(self.id());
        let op = {
            let mut replica = replica.lock().await;
            build(&mut *replica, &others[..], crate::now_ms())?
        };
        if let Some(op) = &op {
            self.distribute(&session, &replica, op.clone()).await;
            self.sessions.touch(session.id).await;
        }
        Ok(op)
    }

    /// Apply a caller-built operation and broadcast it.
    pub async fn send_change(&self, operation: ChangeOperation) -> Result<ChangeOperation, CollabError> {
        let local = self.id();
        let file_path = operation.file_path().to_owned();
        let op = self
            .local_edit(&file_path, move |replica, others, now| {
                if operation.author() != local {
                    return Err(CollabError::PermissionDenied {
                        user: operation.author(),
                        scope: replica.session_id(),
                        required: Permission::Write,
                    });
                }
                replica.apply_local(operation, others, now).map(Some)
            })
            .await?;
        op.ok_or_else(|| CollabError::NoSessionForFile(file_path))
    }

    pub async fn insert(&self, file_path: &str, at: Position, text: &str) -> Result<ChangeOperation, CollabError> {
        let local = self.id();
        let op = self
            .local_edit(file_path, |replica, others, now| {
                let ts = replica.next_timestamp();
                let op = ChangeOperation::insert(local, file_path, ts, at, text);
                replica.apply_local(op, others, now).map(Some)
            })
            .await?;
        op.ok_or_else(|| CollabError::NoSessionForFile(file_path.to_owned()))
    }

    pub async fn delete(&self, file_path: &str, range: TextRange) -> Result<ChangeOperation, CollabError> {
        let local = self.id();
        let op = self
            .local_edit(file_path, |replica, others, now| {
                let replaced = replica.slice(range)?;
                let ts = replica.next_timestamp();
                let op = ChangeOperation::delete(local, file_path, ts, range, replaced);
                replica.apply_local(op, others, now).map(Some)
            })
            .await?;
        op.ok_or_else(|| CollabError::NoSessionForFile(file_path.to_owned()))
    }

    pub async fn replace(
        &self,
        file_path: &str,
        range: TextRange,
        text: &str,
    ) -> Result<ChangeOperation, CollabError> {
        let local = self.id();
        let op = self
            .local_edit(file_path, |replica, others, now| {
                let replaced = replica.slice(range)?;
                let ts = replica.next_timestamp();
                let op = ChangeOperation::replace(local, file_path, ts, range, text, replaced);
                replica.apply_local(op, others, now).map(Some)
            })
            .await?;
        op.ok_or_else(|| CollabError::NoSessionForFile(file_path.to_owned()))
    }

    /// Undo our latest edit on `file_path`. `None` if there is none.
    pub async fn undo(&self, file_path: &str) -> Result<Option<ChangeOperation>, CollabError> {
        self.local_edit(file_path, |replica, others, now| replica.undo(others, now))
            .await
    }

    pub async fn redo(&self, file_path: &str) -> Result<Option<ChangeOperation>, CollabError> {
        self.local_edit(file_path, |replica, others, now| replica.redo(others, now))
            .await
    }

    pub async fn document_text(&self, file_path: &str) -> Result<String, CollabError> {
        let replica = self
            .replicas
            .get(file_path)
            .await
            .ok_or_else(|| CollabError::NoSessionForFile(file_path.to_owned()))?;
        let text = replica.lock().await.text();
        Ok(text)
    }

    /// Operations waiting in the outbox for `file_path`.
    pub async fn outbox_len(&self, file_path: &str) -> usize {
        match self.replicas.get(file_path).await {
            Some(replica) => replica.lock().await.outbox_len(),
            None => 0,
        }
    }

    /// Publish a local operation and send it to the other participants.
    /// Once anything is buffered, new operations queue behind it.
    async fn distribute(&self, session: &EditingSession, replica: &Mutex<FileReplica>, op: ChangeOperation) {
        self.events.publish_change(ChangeEvent {
            session_id: session.id,
            operation: op.clone(),
            origin: ChangeOrigin::Local,
        });
        self.events.publish_session(SessionEvent::new(
            session.id,
            self.id(),
            SessionEventKind::Change {
                operation_id: op.id(),
            },
        ));

        let others = session.others(self.id());
        if others.is_empty() {
            return;
        }
        {
            let mut replica = replica.lock().await;
            if !replica.outbox_is_empty() {
                if !replica.enqueue_outbox(op.clone()) {
                    log::warn!("Outbox for {} full, dropped {}", session.file_path, op.id());
                }
                log::debug!("Queued {} behind {} buffered operations", op.id(), replica.outbox_len());
                return;
            }
        }

        let envelope = Envelope::new(
            self.id(),
            others,
            Payload::Change {
                session_id: session.id,
                operation: op.clone(),
            },
        )
        .with_clock(op.timestamp());
        if let Err(e) = self.transport.send(envelope).await {
            log::warn!("Buffering {} for {}: {e}", op.id(), session.file_path);
            let mut replica = replica.lock().await;
            if !replica.enqueue_outbox(op) {
                log::warn!("Outbox for {} full, dropped operation", session.file_path);
            }
        }
    }

    async fn send_best_effort(&self, recipients: Vec<UserId>, payload: Payload) {
        if recipients.is_empty() {
            return;
        }
        let name = payload.name();
        if let Err(e) = self
            .transport
            .send(Envelope::new(self.id(), recipients, payload))
            .await
        {
            log::warn!("Failed to deliver {name}: {e}");
        }
    }

    // ---- presence ----

    /// Everyone we share an active session with.
    async fn presence_recipients(&self) -> Vec<UserId> {
        let local = self.id();
        let peers: BTreeSet<UserId> = self
            .sessions
            .active_sessions()
            .await
            .iter()
            .flat_map(|s| s.others(local))
            .collect();
        peers.into_iter().collect()
    }

    /// Merge `update` into our presence and tell peers. Cursor-only
    /// updates inside the rate-limit interval are kept local.
    pub async fn update_presence(&self, update: PresenceUpdate) -> UserPresence {
        let (presence, broadcast) = self
            .presence
            .write()
            .await
            .update_local(update, crate::now_ms());
        self.events.publish_presence(presence.clone());
        if broadcast {
            let recipients = self.presence_recipients().await;
            self.send_best_effort(recipients, Payload::Presence(presence.clone()))
                .await;
        }
        presence
    }

    pub async fn broadcast_cursor(&self, file_path: &str, at: Position) -> UserPresence {
        let mut update = PresenceUpdate::cursor(at);
        if !self.in_file(file_path).await {
            update.current_file = Some(file_path.to_owned());
        }
        self.update_presence(update).await
    }

    pub async fn broadcast_selection(&self, file_path: &str, range: TextRange) -> UserPresence {
        let mut update = PresenceUpdate::selection(range);
        if !self.in_file(file_path).await {
            update.current_file = Some(file_path.to_owned());
        }
        self.update_presence(update).await
    }

    async fn in_file(&self, file_path: &str) -> bool {
        self.presence
            .read()
            .await
            .local()
            .is_some_and(|p| p.current_file.as_deref() == Some(file_path))
    }

    /// Online users whose current file is `file_path`.
    pub async fn users_in_file(&self, file_path: &str) -> Vec<UserPresence> {
        self.presence.read().await.users_in_file(file_path)
    }

    pub async fn presence_of(&self, user: UserId) -> Option<UserPresence> {
        self.presence.read().await.get(user).cloned()
    }

    /// Age out silent peers. Returns the records whose status changed.
    pub async fn sweep_presence(&self) -> Vec<UserPresence> {
        let changed = self.presence.write().await.sweep(crate::now_ms());
        for presence in &changed {
            log::debug!("{} is now {:?}", presence.user_id, presence.status);
            self.events.publish_presence(presence.clone());
        }
        changed
    }

    // ---- conflicts ----

    pub async fn pending_conflicts(&self) -> Vec<Conflict> {
        let mut pending = Vec::new();
        for replica in self.replicas.all().await {
            pending.extend(replica.lock().await.pending_conflicts());
        }
        pending.sort_by_key(|c| (c.detected_at, c.id));
        pending
    }

    pub async fn conflict(&self, id: ConflictId) -> Option<Conflict> {
        for replica in self.replicas.all().await {
            if let Some(conflict) = replica.lock().await.conflict(id) {
                return Some(conflict.clone());
            }
        }
        None
    }

    /// Settle a conflict. Returns the correcting operation for `Remote`
    /// and `Merge`; `Local` changes nothing here and only notifies peers.
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: Resolution,
        merged_content: Option<String>,
    ) -> Result<Option<ChangeOperation>, CollabError> {
        let mut found = None;
        for replica in self.replicas.all().await {
            let session_id = {
                let guard = replica.lock().await;
                guard.conflict(id).map(|_| guard.session_id())
            };
            if let Some(session_id) = session_id {
                found = Some((session_id, replica));
                break;
            }
        }
        let (session_id, replica) = found.ok_or(CollabError::ConflictNotFound(id))?;
        let session = self
            .sessions
            .require_permission(session_id, self.id(), Permission::Write)
            .await?;
        let others = session.others(self.id());

        let outcome = replica
            .lock()
            .await
            .resolve(id, resolution, merged_content, &others, crate::now_ms())?;
        self.events
            .publish_conflict(ConflictNotice::Resolved(outcome.conflict().clone()));

        match outcome {
            ResolveOutcome::Notice {
                winner,
                loser,
                timestamp,
                ..
            } => {
                let payload = Payload::Resolution {
                    file_path: session.file_path.clone(),
                    winner,
                    loser,
                    timestamp,
                };
                self.send_best_effort(others, payload).await;
                Ok(None)
            }
            ResolveOutcome::Correction { operation, .. } => {
                self.distribute(&session, &replica, operation.clone()).await;
                Ok(Some(operation))
            }
        }
    }

    async fn policy_for(&self, file_path: &str) -> ConflictPolicy {
        self.rooms
            .room_for_file(file_path)
            .await
            .map(|room| room.conflict_policy)
            .unwrap_or(self.config.conflict_policy)
    }

    // ---- sync ----

    async fn replica_for(&self, file_path: &str) -> Result<(EditingSession, Arc<Mutex<FileReplica>>), CollabError> {
        let session = self
            .sessions
            .session_for_file(file_path)
            .await
            .ok_or_else(|| CollabError::NoSessionForFile(file_path.to_owned()))?;
        let replica = self
            .replicas
            .get_or_open(&session, self.id(), &self.config)
            .await;
        Ok((session, replica))
    }

    /// Operations a peer has that we lack, in the peer's log order. Nothing
    /// is applied.
    pub async fn pull_changes(&self, file_path: &str) -> Result<Vec<ChangeOperation>, CollabError> {
        let (session, replica) = self.replica_for(file_path).await?;
        self.sync.pull_changes(&session, &replica).await
    }

    /// Flush buffered operations. Returns how many left the outbox.
    pub async fn push_changes(&self, file_path: &str) -> Result<usize, CollabError> {
        let (session, replica) = self.replica_for(file_path).await?;
        self.sync.push_changes(&session, &replica).await
    }

    /// Replay base + log and return the content, repairing the live
    /// document if it drifted.
    pub async fn sync_file(&self, file_path: &str) -> Result<String, CollabError> {
        let (_, replica) = self.replica_for(file_path).await?;
        self.sync.sync_file(&replica).await
    }

    /// Pull from a peer and integrate what came back. Returns how many
    /// operations reached the document or the conflict queue.
    pub async fn catch_up(&self, file_path: &str) -> Result<usize, CollabError> {
        let (session, replica) = self.replica_for(file_path).await?;
        let batch = self.sync.fetch(&session, &replica).await?;
        let responder = batch.responder;
        let last = batch.operations.last().map(ChangeOperation::id);

        let results = {
            let mut replica = replica.lock().await;
            replica.expire_window(crate::now_ms(), self.config.ack_timeout_ms);
            let results = replica.integrate_pulled(responder, batch.operations, crate::now_ms());
            if let Some(last) = last {
                replica.set_pulled(responder, last);
            }
            results
        };
        let count = results.len();
        for result in results {
            self.after_integration(&session, result).await;
        }
        log::info!("Caught up {count} operations on {file_path} from {responder}");
        Ok(count)
    }

    /// Publish, acknowledge and auto-resolve after a remote integration.
    async fn after_integration(&self, session: &EditingSession, result: Integration) {
        match result {
            Integration::Applied(op) => {
                self.publish_remote(session, &op);
                self.acknowledge(session, &op).await;
            }
            Integration::Adopted { conflict, operation } => {
                if let Some(op) = operation {
                    self.publish_remote(session, &op);
                    self.acknowledge(session, &op).await;
                }
                self.events.publish_conflict(ConflictNotice::Resolved(conflict));
            }
            Integration::Conflicted(conflict) => {
                let conflict_id = conflict.id;
                self.events.publish_session(SessionEvent::new(
                    session.id,
                    conflict.remote.author(),
                    SessionEventKind::Conflict { conflict_id },
                ));
                let policy = self.policy_for(&session.file_path).await;
                let auto = resolver::auto_resolution(policy, &conflict);
                self.events.publish_conflict(ConflictNotice::Detected(conflict));
                if let Some(resolution) = auto {
                    log::info!("Auto-resolving conflict {conflict_id} as {resolution}");
                    if let Err(e) = self.resolve_conflict(conflict_id, resolution, None).await {
                        log::warn!("Auto-resolution of {conflict_id} failed: {e}");
                    }
                }
            }
            Integration::Ignored => {}
        }
    }

    fn publish_remote(&self, session: &EditingSession, op: &ChangeOperation) {
        let origin = if op.author() == self.id() {
            ChangeOrigin::Local
        } else {
            ChangeOrigin::Remote
        };
        self.events.publish_change(ChangeEvent {
            session_id: session.id,
            operation: op.clone(),
            origin,
        });
        self.events.publish_session(SessionEvent::new(
            session.id,
            op.author(),
            SessionEventKind::Change {
                operation_id: op.id(),
            },
        ));
    }

    async fn acknowledge(&self, session: &EditingSession, op: &ChangeOperation) {
        if op.author() == self.id() {
            return;
        }
        let payload = Payload::Ack {
            file_path: session.file_path.clone(),
            operation_id: op.id(),
        };
        self.send_best_effort(vec![op.author()], payload).await;
    }

    // ---- inbound ----

    /// Session in which `sender` may write to `file_path`.
    fn writer_session(&self, sender: UserId, session: Option<EditingSession>) -> Option<EditingSession> {
        let session = session?;
        if !session.is_active() {
            log::warn!("Dropped change from {sender}: session {} is not active", session.id);
            return None;
        }
        match session.permission_of(sender) {
            Some(p) if p >= Permission::Write => Some(session),
            Some(p) => {
                log::warn!("Rejected change from {sender} with {p} permission in {}", session.id);
                None
            }
            None => {
                log::warn!("Rejected change from non-participant {sender} in {}", session.id);
                None
            }
        }
    }

    async fn integrate(
        &self,
        session: &EditingSession,
        ops: Vec<ChangeOperation>,
        coordinate_author: UserId,
    ) -> usize {
        let replica = self
            .replicas
            .get_or_open(session, self.id(), &self.config)
            .await;
        let results: Vec<Integration> = {
            let mut replica = replica.lock().await;
            let now = crate::now_ms();
            replica.expire_window(now, self.config.ack_timeout_ms);
            ops.into_iter()
                .filter_map(|op| match replica.integrate_remote(op, coordinate_author, now) {
                    Ok(result) => Some(result),
                    Err(e) => {
                        log::warn!("Rejected operation from {coordinate_author}: {e}");
                        None
                    }
                })
                .collect()
        };
        let accepted = results.len();
        for result in results {
            self.after_integration(session, result).await;
        }
        self.sessions.touch(session.id).await;
        accepted
    }

    async fn on_change(&self, sender: UserId, session_id: SessionId, op: ChangeOperation) {
        if op.author() != sender {
            log::warn!("Dropped operation {} relayed by {sender}", op.id());
            return;
        }
        let Some(session) = self
            .writer_session(sender, self.sessions.session(session_id).await)
        else {
            return;
        };
        if op.file_path() != session.file_path {
            log::warn!("Dropped operation for {} in session on {}", op.file_path(), session.file_path);
            return;
        }
        self.integrate(&session, vec![op], sender).await;
    }

    async fn on_ack(&self, sender: UserId, file_path: &str, operation_id: OperationId) {
        if let Some(replica) = self.replicas.get(file_path).await {
            if replica.lock().await.ack(operation_id, sender) {
                log::trace!("{operation_id} acknowledged by every peer");
            }
        }
    }

    async fn on_presence(&self, sender: UserId, presence: UserPresence) {
        if presence.user_id != sender {
            log::warn!("Dropped presence of {} relayed by {sender}", presence.user_id);
            return;
        }
        let applied = self.presence.write().await.apply_remote(presence);
        if let Some(presence) = applied {
            self.events.publish_presence(presence);
        }
    }

    async fn on_event(&self, sender: UserId, event: SessionEvent) {
        let user = event.user_id;
        let kind = event.kind.clone();
        let Some(session) = self.sessions.apply_event(sender, event).await else {
            return;
        };
        match kind {
            SessionEventKind::UserLeft => {
                if let Some(replica) = self.replicas.get(&session.file_path).await {
                    let dropped = replica.lock().await.forget_peer(user);
                    if !dropped.is_empty() {
                        log::info!("Dropped {} conflicts with {user}, who left", dropped.len());
                    }
                }
                let left = self
                    .presence
                    .write()
                    .await
                    .leave_file(user, &session.file_path, crate::now_ms());
                if let Some(presence) = left {
                    self.events.publish_presence(presence);
                }
            }
            SessionEventKind::SessionEnded => {
                self.close_replica(&session.file_path).await;
                let left = self
                    .presence
                    .write()
                    .await
                    .leave_file(self.id(), &session.file_path, crate::now_ms());
                if let Some(presence) = left {
                    self.events.publish_presence(presence);
                }
            }
            _ => {}
        }
    }

    async fn on_resolution(
        &self,
        sender: UserId,
        file_path: &str,
        winner: OperationId,
        loser: OperationId,
        timestamp: u64,
    ) {
        let Some(session) = self
            .writer_session(sender, self.sessions.session_for_file(file_path).await)
        else {
            return;
        };
        let Some(replica) = self.replicas.get(file_path).await else {
            return;
        };
        let result = replica
            .lock()
            .await
            .integrate_resolution(sender, winner, loser, timestamp);
        match result {
            Ok(result) => self.after_integration(&session, result).await,
            Err(e) => log::warn!("Could not apply resolution from {sender}: {e}"),
        }
    }

    async fn on_pull(
        &self,
        sender: UserId,
        file_path: String,
        after: Option<OperationId>,
        seen: HashMap<UserId, u64>,
    ) -> Option<Payload> {
        let session = self.sessions.session_for_file(&file_path).await?;
        if !session.is_participant(sender) {
            log::warn!("Refused pull of {file_path} by non-participant {sender}");
            return None;
        }
        let replica = self
            .replicas
            .get_or_open(&session, self.id(), &self.config)
            .await;
        let replica = replica.lock().await;
        match SyncCoordinator::serve_pull(&replica, sender, after, &seen) {
            Ok(batch) => {
                log::debug!("Serving {} operations of {file_path} to {sender}", batch.count);
                Some(Payload::PullResponse(batch))
            }
            Err(e) => {
                log::warn!("Failed to serve pull of {file_path}: {e}");
                None
            }
        }
    }

    async fn on_push(&self, sender: UserId, batch: OperationBatch) -> Option<Payload> {
        let file_path = batch.file_path.clone();
        let session = self
            .writer_session(sender, self.sessions.session_for_file(&file_path).await)?;
        let ops = match batch.decompress() {
            Ok(ops) => ops,
            Err(e) => {
                log::warn!("Bad push from {sender}: {e}");
                return None;
            }
        };
        let (own, relayed): (Vec<_>, Vec<_>) = ops.into_iter().partition(|op| op.author() == sender);
        if !relayed.is_empty() {
            log::warn!("Dropped {} relayed operations in push from {sender}", relayed.len());
        }
        let accepted = self.integrate(&session, own, sender).await;
        Some(Payload::PushAck {
            file_path,
            accepted: accepted as u32,
        })
    }
}

#[async_trait]
impl MessageHandler for Collaborator {
    async fn handle_message(&self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropped undecodable message: {e}");
                return;
            }
        };
        let sender = envelope.sender;
        log::trace!("{} received {} from {sender}", self.id(), envelope.payload.name());
        match envelope.payload {
            Payload::Change {
                session_id,
                operation,
            } => self.on_change(sender, session_id, operation).await,
            Payload::Ack {
                file_path,
                operation_id,
            } => self.on_ack(sender, &file_path, operation_id).await,
            Payload::Presence(presence) => self.on_presence(sender, presence).await,
            Payload::Event(event) => self.on_event(sender, event).await,
            Payload::SessionAnnounce(session) => self.sessions.apply_announce(sender, session).await,
            Payload::Resolution {
                file_path,
                winner,
                loser,
                timestamp,
            } => {
                self.on_resolution(sender, &file_path, winner, loser, timestamp)
                    .await
            }
            other => log::warn!("Unexpected {} message from {sender}", other.name()),
        }
    }

    async fn handle_request(&self, envelope: Envelope) -> Option<Envelope> {
        let sender = envelope.sender;
        let payload = match envelope.payload {
            Payload::FetchSession { session_id } => {
                Some(Payload::SessionSnapshot(self.sessions.session(session_id).await))
            }
            Payload::PullRequest {
                file_path,
                after,
                seen,
            } => self.on_pull(sender, file_path, after, seen).await,
            Payload::Push(batch) => self.on_push(sender, batch).await,
            Payload::Ping => Some(Payload::Pong),
            other => {
                log::warn!("Unexpected {} request from {sender}", other.name());
                None
            }
        }?;
        Some(Envelope::to(self.id(), sender, payload))
    }
}
