//! Collaboration rooms: longer-lived membership and policy scopes.
//!
//! A room owns a set of files. Sessions on those files take their
//! permissions and conflict policy from the room; files outside every room
//! fall back to [`CollabConfig`](crate::config::CollabConfig).

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use tandem_core::{RoomId, UserId};

use crate::error::CollabError;
use crate::session::Permission;

/// Automatic conflict resolution for a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Conflicts wait for a user decision.
    #[default]
    Manual,
    /// The operation with the higher (timestamp, author) wins.
    LatestWins,
    /// The operation starting earlier in the document wins.
    EarliestPositionWins,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationRoom {
    pub id: RoomId,
    pub name: String,
    pub owner: UserId,
    pub members: HashMap<UserId, Permission>,
    pub is_public: bool,
    pub default_permission: Permission,
    pub files: BTreeSet<String>,
    pub conflict_policy: ConflictPolicy,
}

impl CollaborationRoom {
    pub fn new(owner: UserId, name: impl Into<String>, is_public: bool) -> Self {
        let mut members = HashMap::new();
        members.insert(owner, Permission::Admin);
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner,
            members,
            is_public,
            default_permission: Permission::Write,
            files: BTreeSet::new(),
            conflict_policy: ConflictPolicy::Manual,
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_default_permission(mut self, permission: Permission) -> Self {
        self.default_permission = permission;
        self
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.members.contains_key(&user)
    }

    /// Permission `user` gets in sessions scoped by this room, or `None`
    /// if a private room does not admit them.
    pub fn permission_for(&self, user: UserId) -> Option<Permission> {
        match self.members.get(&user) {
            Some(p) => Some(*p),
            None if self.is_public => Some(self.default_permission),
            None => None,
        }
    }

    fn require_admin(&self, user: UserId) -> Result<(), CollabError> {
        if self.members.get(&user) == Some(&Permission::Admin) {
            Ok(())
        } else {
            Err(CollabError::PermissionDenied {
                user,
                scope: self.id,
                required: Permission::Admin,
            })
        }
    }
}

/// Shared membership store consulted by every collaborator in a process.
pub struct RoomDirectory {
    rooms: RwLock<HashMap<RoomId, CollaborationRoom>>,
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_room(&self, room: CollaborationRoom) -> RoomId {
        let id = room.id;
        log::info!("Room '{}' ({id}) created by {}", room.name, room.owner);
        self.rooms.write().await.insert(id, room);
        id
    }

    /// Add `user` to a room. Public rooms admit anyone with the room
    /// default; private rooms only admit users an admin invited.
    pub async fn join_room(&self, room_id: RoomId, user: UserId) -> Result<Permission, CollabError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id).ok_or(CollabError::RoomNotFound(room_id))?;
        let permission = room.permission_for(user).ok_or(CollabError::PermissionDenied {
            user,
            scope: room_id,
            required: Permission::Read,
        })?;
        room.members.insert(user, permission);
        log::debug!("User {user} joined room {room_id} with {permission}");
        Ok(permission)
    }

    /// Returns false if the user was not a member.
    pub async fn leave_room(&self, room_id: RoomId, user: UserId) -> Result<bool, CollabError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id).ok_or(CollabError::RoomNotFound(room_id))?;
        if room.owner == user {
            log::warn!("Owner {user} left room {room_id}");
        }
        Ok(room.members.remove(&user).is_some())
    }

    /// Admin-only: grant `user` a permission in the room.
    pub async fn invite(
        &self,
        room_id: RoomId,
        by: UserId,
        user: UserId,
        permission: Permission,
    ) -> Result<(), CollabError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id).ok_or(CollabError::RoomNotFound(room_id))?;
        room.require_admin(by)?;
        room.members.insert(user, permission);
        Ok(())
    }

    /// Admin-only: put `file_path` under this room.
    pub async fn add_file(
        &self,
        room_id: RoomId,
        by: UserId,
        file_path: impl Into<String>,
    ) -> Result<(), CollabError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id).ok_or(CollabError::RoomNotFound(room_id))?;
        room.require_admin(by)?;
        room.files.insert(file_path.into());
        Ok(())
    }

    pub async fn room_files(&self, room_id: RoomId) -> Result<Vec<String>, CollabError> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(&room_id).ok_or(CollabError::RoomNotFound(room_id))?;
        Ok(room.files.iter().cloned().collect())
    }

    pub async fn room(&self, room_id: RoomId) -> Option<CollaborationRoom> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    /// The room scoping `file_path`, if any.
    pub async fn room_for_file(&self, file_path: &str) -> Option<CollaborationRoom> {
        self.rooms
            .read()
            .await
            .values()
            .find(|room| room.files.contains(file_path))
            .cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
