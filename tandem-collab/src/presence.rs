//! Who is where: cursors, selections and liveness of collaborators.
//!
//! Presence travels independently of operations and is fire-and-forget.
//! Each record carries a `revision` bumped by its owner, so a late or
//! duplicated update never overwrites a newer one and a missed update is
//! simply superseded by the next.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! PresenceTracker::update_local()   (cursor-only updates rate-limited)
//!       │
//!       ▼   Payload::Presence over the transport
//! remote PresenceTracker::apply_remote()   (stale revisions dropped)
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use tandem_core::{Position, TextRange, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Display color for a collaborator's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresenceColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl PresenceColor {
    /// Stable, saturated color derived from a user id.
    pub fn from_user(id: UserId) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b }
    }

    /// `#rrggbb`.
    pub fn to_hex(&self) -> String {
        let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", byte(self.r), byte(self.g), byte(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub display_name: String,
    pub status: PresenceStatus,
    pub current_file: Option<String>,
    pub cursor: Option<Position>,
    pub selection: Option<TextRange>,
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
    pub color: PresenceColor,
    pub revision: u64,
}

impl UserPresence {
    pub fn new(user_id: UserId, display_name: impl Into<String>, now_ms: u64) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            status: PresenceStatus::Online,
            current_file: None,
            cursor: None,
            selection: None,
            last_seen: now_ms,
            color: PresenceColor::from_user(user_id),
            revision: 0,
        }
    }

    pub fn is_in_file(&self, file_path: &str) -> bool {
        self.status == PresenceStatus::Online && self.current_file.as_deref() == Some(file_path)
    }
}

/// Partial presence change. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub status: Option<PresenceStatus>,
    pub current_file: Option<String>,
    pub cursor: Option<Position>,
    pub selection: Option<TextRange>,
}

impl PresenceUpdate {
    pub fn cursor(at: Position) -> Self {
        Self {
            cursor: Some(at),
            ..Self::default()
        }
    }

    pub fn selection(range: TextRange) -> Self {
        Self {
            selection: Some(range),
            ..Self::default()
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            current_file: Some(path.into()),
            status: Some(PresenceStatus::Online),
            ..Self::default()
        }
    }

    pub fn status(status: PresenceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Only the cursor moves. These are the updates that get throttled.
    pub fn is_cursor_only(&self) -> bool {
        self.cursor.is_some()
            && self.status.is_none()
            && self.current_file.is_none()
            && self.selection.is_none()
    }
}

/// Presence records for the local user and every peer heard from.
pub struct PresenceTracker {
    local: UserId,
    presences: HashMap<UserId, UserPresence>,
    last_cursor_broadcast: Option<Instant>,
    cursor_interval: Duration,
    away_after_ms: u64,
    offline_after_ms: u64,
}

impl PresenceTracker {
    pub fn new(
        local: UserId,
        display_name: impl Into<String>,
        cursor_interval: Duration,
        away_after_ms: u64,
        offline_after_ms: u64,
        now_ms: u64,
    ) -> Self {
        let mut presences = HashMap::new();
        presences.insert(local, UserPresence::new(local, display_name, now_ms));
        Self {
            local,
            presences,
            last_cursor_broadcast: None,
            cursor_interval,
            away_after_ms,
            offline_after_ms,
        }
    }

    pub fn local(&self) -> Option<&UserPresence> {
        self.presences.get(&self.local)
    }

    /// Merge `update` into the local record.
    ///
    /// Returns the merged record and whether it should be broadcast; cursor
    /// moves inside the rate-limit interval are kept locally only.
    pub fn update_local(&mut self, update: PresenceUpdate, now_ms: u64) -> (UserPresence, bool) {
        let throttled = update.is_cursor_only()
            && self
                .last_cursor_broadcast
                .is_some_and(|at| at.elapsed() < self.cursor_interval);

        let local = self.local;
        let presence = self
            .presences
            .entry(local)
            .or_insert_with(|| UserPresence::new(local, String::new(), now_ms));
        if let Some(status) = update.status {
            presence.status = status;
        }
        if let Some(file) = update.current_file {
            if presence.current_file.as_deref() != Some(file.as_str()) {
                presence.cursor = None;
                presence.selection = None;
            }
            presence.current_file = Some(file);
        }
        if let Some(cursor) = update.cursor {
            presence.cursor = Some(cursor);
        }
        if let Some(selection) = update.selection {
            presence.selection = Some(selection);
        }
        presence.last_seen = now_ms;
        presence.revision += 1;
        let snapshot = presence.clone();

        if throttled {
            log::trace!("Cursor update throttled");
            return (snapshot, false);
        }
        if update.cursor.is_some() {
            self.last_cursor_broadcast = Some(Instant::now());
        }
        (snapshot, true)
    }

    /// Record a peer's presence. Returns it if it was newer than what we had.
    pub fn apply_remote(&mut self, presence: UserPresence) -> Option<UserPresence> {
        if presence.user_id == self.local {
            return None;
        }
        if let Some(existing) = self.presences.get(&presence.user_id) {
            if existing.revision >= presence.revision {
                log::trace!(
                    "Dropped stale presence r{} for {} (have r{})",
                    presence.revision,
                    presence.user_id,
                    existing.revision
                );
                return None;
            }
        }
        self.presences.insert(presence.user_id, presence.clone());
        Some(presence)
    }

    /// Clear `user`'s file if it is `file_path`. Returns the updated record.
    pub fn leave_file(&mut self, user: UserId, file_path: &str, now_ms: u64) -> Option<UserPresence> {
        let presence = self.presences.get_mut(&user)?;
        if presence.current_file.as_deref() != Some(file_path) {
            return None;
        }
        presence.current_file = None;
        presence.cursor = None;
        presence.selection = None;
        if user == self.local {
            presence.last_seen = now_ms;
            presence.revision += 1;
        }
        Some(presence.clone())
    }

    pub fn remove_user(&mut self, user: UserId) -> Option<UserPresence> {
        if user == self.local {
            return None;
        }
        self.presences.remove(&user)
    }

    /// Online presences in `file_path`, ordered by user id.
    pub fn users_in_file(&self, file_path: &str) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> = self
            .presences
            .values()
            .filter(|p| p.is_in_file(file_path))
            .cloned()
            .collect();
        users.sort_by_key(|p| p.user_id);
        users
    }

    pub fn get(&self, user: UserId) -> Option<&UserPresence> {
        self.presences.get(&user)
    }

    /// Downgrade peers that have gone quiet: online → away → offline.
    /// Returns the records whose status changed.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<UserPresence> {
        let mut changed = Vec::new();
        for presence in self.presences.values_mut() {
            if presence.user_id == self.local {
                continue;
            }
            let idle = now_ms.saturating_sub(presence.last_seen);
            let status = if idle > self.offline_after_ms {
                PresenceStatus::Offline
            } else if idle > self.away_after_ms {
                PresenceStatus::Away
            } else {
                presence.status
            };
            if status != presence.status && presence.status != PresenceStatus::Offline {
                presence.status = status;
                changed.push(presence.clone());
            }
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.presences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presences.is_empty()
    }
}
