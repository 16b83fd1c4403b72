//! Editing sessions: who may touch which file, and in what role.
//!
//! Every collaborator keeps its own view of the sessions it takes part in.
//! Views converge through [`Payload::SessionAnnounce`] when a session starts
//! and [`Payload::Event`] for membership changes after that.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use tandem_core::{SessionId, UserId};

use crate::error::CollabError;
use crate::events::{EventHub, SessionEvent, SessionEventKind};
use crate::protocol::{Envelope, Payload};
use crate::room::RoomDirectory;
use crate::transport::Transport;

/// Role inside a session. Ordered: `Read < Write < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Ending,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditingSession {
    pub id: SessionId,
    pub file_path: String,
    pub host: UserId,
    pub participants: BTreeMap<UserId, Permission>,
    /// File content the session started from. Replaying the operation log
    /// over it yields the current document.
    pub base_content: String,
    pub started_at: u64,
    pub last_activity: u64,
    pub state: SessionState,
}

impl EditingSession {
    fn new(file_path: String, host: UserId, base_content: String) -> Self {
        let now = crate::now_ms();
        Self {
            id: Uuid::new_v4(),
            file_path,
            host,
            participants: BTreeMap::new(),
            base_content,
            started_at: now,
            last_activity: now,
            state: SessionState::Created,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn permission_of(&self, user: UserId) -> Option<Permission> {
        self.participants.get(&user).copied()
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.participants.contains_key(&user)
    }

    /// Participant ids in ascending order.
    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.keys().copied().collect()
    }

    /// Every participant except `local`.
    pub fn others(&self, local: UserId) -> Vec<UserId> {
        self.participants
            .keys()
            .copied()
            .filter(|id| *id != local)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
}

impl UserProfile {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
        }
    }
}

/// Local view of sessions plus the known-user directory.
pub struct SessionManager {
    local: UserProfile,
    default_permission: Permission,
    rooms: Arc<RoomDirectory>,
    users: RwLock<HashMap<UserId, UserProfile>>,
    sessions: RwLock<HashMap<SessionId, EditingSession>>,
    transport: Arc<dyn Transport>,
    events: Arc<EventHub>,
}

impl SessionManager {
    pub fn new(
        local: UserProfile,
        default_permission: Permission,
        rooms: Arc<RoomDirectory>,
        transport: Arc<dyn Transport>,
        events: Arc<EventHub>,
    ) -> Self {
        let mut users = HashMap::new();
        users.insert(local.id, local.clone());
        Self {
            local,
            default_permission,
            rooms,
            users: RwLock::new(users),
            sessions: RwLock::new(HashMap::new()),
            transport,
            events,
        }
    }

    pub fn local(&self) -> &UserProfile {
        &self.local
    }

    pub async fn register_user(&self, profile: UserProfile) {
        log::debug!("Registered user {} ({})", profile.display_name, profile.id);
        self.users.write().await.insert(profile.id, profile);
    }

    pub async fn user(&self, id: UserId) -> Option<UserProfile> {
        self.users.read().await.get(&id).cloned()
    }

    pub async fn session(&self, id: SessionId) -> Option<EditingSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// The active session editing `file_path`, if any.
    pub async fn session_for_file(&self, file_path: &str) -> Option<EditingSession> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.is_active() && s.file_path == file_path)
            .cloned()
    }

    pub async fn active_sessions(&self) -> Vec<EditingSession> {
        let mut active: Vec<EditingSession> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.started_at);
        active
    }

    /// Open a session on `file_path` with the caller and `participants`.
    ///
    /// The caller gets `write`, or `admin` if they own the room scoping the
    /// file or no room scopes it. Named participants get their room
    /// permission, or the configured default.
    pub async fn start_session(
        &self,
        file_path: &str,
        base_content: &str,
        participants: &[UserId],
    ) -> Result<EditingSession, CollabError> {
        let local = self.local.id;
        {
            let users = self.users.read().await;
            if let Some(unknown) = participants.iter().find(|p| !users.contains_key(*p)) {
                return Err(CollabError::UnknownUser(*unknown));
            }
        }
        if let Some(existing) = self.session_for_file(file_path).await {
            return Err(CollabError::SessionAlreadyActive {
                file_path: file_path.to_owned(),
                session_id: existing.id,
            });
        }

        let room = self.rooms.room_for_file(file_path).await;
        let mut session = EditingSession::new(file_path.to_owned(), local, base_content.to_owned());
        let host_permission = match &room {
            None => Permission::Admin,
            Some(room) if room.owner == local => Permission::Admin,
            Some(room) => {
                room.permission_for(local).ok_or(CollabError::PermissionDenied {
                    user: local,
                    scope: room.id,
                    required: Permission::Read,
                })?;
                Permission::Write
            }
        };
        session.participants.insert(local, host_permission);
        for &user in participants.iter().filter(|p| **p != local) {
            let permission = match &room {
                Some(room) => room.permission_for(user).ok_or(CollabError::PermissionDenied {
                    user,
                    scope: room.id,
                    required: Permission::Read,
                })?,
                None => self.default_permission,
            };
            session.participants.insert(user, permission);
        }
        session.state = SessionState::Active;

        {
            let mut sessions = self.sessions.write().await;
            // Re-check under the write lock.
            if let Some(existing) = sessions
                .values()
                .find(|s| s.is_active() && s.file_path == file_path)
            {
                return Err(CollabError::SessionAlreadyActive {
                    file_path: file_path.to_owned(),
                    session_id: existing.id,
                });
            }
            sessions.insert(session.id, session.clone());
        }
        log::info!(
            "Session {} started on {file_path} with {} participants",
            session.id,
            session.participants.len()
        );

        self.broadcast(session.others(local), Payload::SessionAnnounce(session.clone()))
            .await;
        self.events.publish_session(SessionEvent::new(
            session.id,
            local,
            SessionEventKind::FileOpened {
                file_path: file_path.to_owned(),
            },
        ));
        Ok(session)
    }

    /// Join `session_id`, asking known peers for it if it is not known here.
    pub async fn join_session(&self, session_id: SessionId) -> Result<EditingSession, CollabError> {
        let local = self.local.id;
        let session = match self.session(session_id).await {
            Some(session) => session,
            None => self.fetch_session(session_id).await?,
        };
        if !session.is_active() {
            return Err(CollabError::SessionInactive(session_id));
        }
        if session.is_participant(local) {
            self.sessions.write().await.insert(session.id, session.clone());
            return Ok(session);
        }

        let permission = self.joining_permission(&session.file_path, local).await?;

        let mut session = session;
        session.participants.insert(local, permission);
        session.last_activity = crate::now_ms();
        self.sessions.write().await.insert(session.id, session.clone());
        log::info!("Joined session {session_id} on {} as {permission}", session.file_path);

        let event = SessionEvent::new(
            session_id,
            local,
            SessionEventKind::UserJoined {
                display_name: self.local.display_name.clone(),
                permission,
            },
        );
        self.broadcast(session.others(local), Payload::Event(event.clone()))
            .await;
        self.events.publish_session(event);
        Ok(session)
    }

    /// Permission `user` gets on joining a session on `file_path`: the
    /// room's grant if a room scopes the file, the default otherwise.
    async fn joining_permission(&self, file_path: &str, user: UserId) -> Result<Permission, CollabError> {
        match self.rooms.room_for_file(file_path).await {
            Some(room) => room.permission_for(user).ok_or(CollabError::PermissionDenied {
                user,
                scope: room.id,
                required: Permission::Read,
            }),
            None => Ok(self.default_permission),
        }
    }

    async fn fetch_session(&self, session_id: SessionId) -> Result<EditingSession, CollabError> {
        let mut peers: Vec<UserId> = self
            .users
            .read()
            .await
            .keys()
            .copied()
            .filter(|id| *id != self.local.id)
            .collect();
        peers.sort();

        for peer in peers {
            let request = Envelope::to(self.local.id, peer, Payload::FetchSession { session_id });
            match self.transport.request(peer, request).await {
                Ok(Envelope {
                    payload: Payload::SessionSnapshot(Some(session)),
                    ..
                }) => {
                    log::debug!("Fetched session {session_id} from {peer}");
                    return Ok(session);
                }
                Ok(_) => continue,
                Err(e) => log::debug!("Session lookup at {peer} failed: {e}"),
            }
        }
        Err(CollabError::SessionNotFound(session_id))
    }

    /// Remove the caller from `session_id`. Returns the session as it was
    /// before leaving; the last participant out ends it.
    pub async fn leave_session(&self, session_id: SessionId) -> Result<EditingSession, CollabError> {
        let local = self.local.id;
        let before = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get(&session_id)
                .ok_or(CollabError::SessionNotFound(session_id))?;
            if !session.is_participant(local) {
                return Err(CollabError::NotParticipant {
                    user: local,
                    session_id,
                });
            }
            sessions
                .remove(&session_id)
                .ok_or(CollabError::SessionNotFound(session_id))?
        };
        let others = before.others(local);
        if others.is_empty() {
            log::info!("Last participant left, session {session_id} ended");
        } else {
            log::info!("Left session {session_id}");
        }

        let event = SessionEvent::new(session_id, local, SessionEventKind::UserLeft);
        self.broadcast(others, Payload::Event(event.clone())).await;
        self.events.publish_session(event);
        Ok(before)
    }

    /// Admin-only: move the session through `ending` to `ended`.
    pub async fn end_session(&self, session_id: SessionId) -> Result<EditingSession, CollabError> {
        let local = self.local.id;
        self.require_permission(session_id, local, Permission::Admin)
            .await?;
        let ended = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(CollabError::SessionNotFound(session_id))?;
            session.state = SessionState::Ending;
            log::debug!("Session {session_id} ending");
            session.state = SessionState::Ended;
            session.last_activity = crate::now_ms();
            session.clone()
        };
        log::info!("Session {session_id} on {} ended", ended.file_path);

        let event = SessionEvent::new(session_id, local, SessionEventKind::SessionEnded);
        self.broadcast(ended.others(local), Payload::Event(event.clone()))
            .await;
        self.events.publish_session(event);
        Ok(ended)
    }

    /// Admin-only: set `user`'s permission in the session.
    pub async fn grant_permission(
        &self,
        session_id: SessionId,
        user: UserId,
        permission: Permission,
    ) -> Result<EditingSession, CollabError> {
        let local = self.local.id;
        self.require_permission(session_id, local, Permission::Admin)
            .await?;
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(CollabError::SessionNotFound(session_id))?;
            let slot = session
                .participants
                .get_mut(&user)
                .ok_or(CollabError::NotParticipant { user, session_id })?;
            *slot = permission;
            session.clone()
        };
        log::info!("Granted {permission} to {user} in session {session_id}");

        let event = SessionEvent::new(session_id, user, SessionEventKind::PermissionChanged { permission });
        self.broadcast(session.others(local), Payload::Event(event.clone()))
            .await;
        self.events.publish_session(event);
        Ok(session)
    }

    /// The session, if `user` is an active participant with at least
    /// `required`.
    pub async fn require_permission(
        &self,
        session_id: SessionId,
        user: UserId,
        required: Permission,
    ) -> Result<EditingSession, CollabError> {
        let session = self
            .session(session_id)
            .await
            .ok_or(CollabError::SessionNotFound(session_id))?;
        if !session.is_active() {
            return Err(CollabError::SessionInactive(session_id));
        }
        match session.permission_of(user) {
            None => Err(CollabError::NotParticipant { user, session_id }),
            Some(p) if p < required => Err(CollabError::PermissionDenied {
                user,
                scope: session_id,
                required,
            }),
            Some(_) => Ok(session),
        }
    }

    pub async fn touch(&self, session_id: SessionId) {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.last_activity = crate::now_ms();
        }
    }

    /// A peer started a session naming us.
    ///
    /// Only the host may announce a session, and a session we already
    /// track is never replaced by an announce.
    pub async fn apply_announce(&self, sender: UserId, session: EditingSession) {
        if sender != session.host {
            log::warn!("Ignored session {} announced by {sender}, not its host", session.id);
            return;
        }
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            log::warn!("Ignored repeated announce of session {} from {sender}", session.id);
            return;
        }
        if let Some(other) = sessions
            .values()
            .find(|s| s.is_active() && s.file_path == session.file_path && s.id != session.id)
        {
            log::warn!(
                "Ignored session {} from {sender}: {} already has active session {}",
                session.id,
                session.file_path,
                other.id
            );
            return;
        }
        log::info!("Session {} on {} announced by {sender}", session.id, session.file_path);
        let event = SessionEvent::new(
            session.id,
            sender,
            SessionEventKind::FileOpened {
                file_path: session.file_path.clone(),
            },
        );
        sessions.insert(session.id, session);
        drop(sessions);
        self.events.publish_session(event);
    }

    /// Fold a peer's session event into the local view.
    ///
    /// Returns the updated session, or `None` if the event was rejected
    /// or refers to a session we do not track. A joiner's permission is
    /// worked out here, never taken from the event; a participant who
    /// joins again keeps the permission they have.
    pub async fn apply_event(&self, sender: UserId, mut event: SessionEvent) -> Option<EditingSession> {
        let joined_as = match event.kind {
            SessionEventKind::UserJoined { .. } if sender == event.user_id => {
                let file_path = self.session(event.session_id).await?.file_path;
                Some(self.joining_permission(&file_path, sender).await)
            }
            _ => None,
        };

        let mut granted = None;
        let updated = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&event.session_id)?;
            let sender_is_admin = session.permission_of(sender) == Some(Permission::Admin);
            match &event.kind {
                SessionEventKind::UserJoined { .. } if sender == event.user_id => {
                    let permission = match (session.permission_of(sender), joined_as) {
                        (Some(current), _) => current,
                        (None, Some(Ok(fresh))) => {
                            session.participants.insert(sender, fresh);
                            fresh
                        }
                        (None, Some(Err(e))) => {
                            log::warn!("Rejected join of session {} by {sender}: {e}", event.session_id);
                            return None;
                        }
                        (None, None) => return None,
                    };
                    granted = Some(permission);
                }
                SessionEventKind::UserLeft if sender == event.user_id => {
                    session.participants.remove(&event.user_id);
                    if session.participants.is_empty() {
                        session.state = SessionState::Ended;
                    }
                }
                SessionEventKind::PermissionChanged { permission } if sender_is_admin => {
                    if let Some(slot) = session.participants.get_mut(&event.user_id) {
                        *slot = *permission;
                    }
                }
                SessionEventKind::SessionEnded if sender_is_admin => {
                    session.state = SessionState::Ended;
                }
                SessionEventKind::UserJoined { .. }
                | SessionEventKind::UserLeft
                | SessionEventKind::PermissionChanged { .. }
                | SessionEventKind::SessionEnded => {
                    log::warn!(
                        "Rejected {:?} for session {} from {sender}",
                        event.kind,
                        event.session_id
                    );
                    return None;
                }
                _ => {}
            }
            session.last_activity = event.timestamp.max(session.last_activity);
            session.clone()
        };
        if let (Some(granted), SessionEventKind::UserJoined { permission, .. }) = (granted, &mut event.kind) {
            *permission = granted;
        }
        self.events.publish_session(event);
        Some(updated)
    }

    async fn broadcast(&self, recipients: Vec<UserId>, payload: Payload) {
        if recipients.is_empty() {
            return;
        }
        let name = payload.name();
        let envelope = Envelope::new(self.local.id, recipients, payload);
        if let Err(e) = self.transport.send(envelope).await {
            log::warn!("Failed to deliver {name}: {e}");
        }
    }
}
