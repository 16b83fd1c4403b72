//! Runtime knobs for a collaborator.
//!
//! Everything has a default, so a JSON file only needs the fields it wants
//! to override:
//!
//! ```json
//! { "ack_timeout_ms": 10000, "conflict_policy": "latest_wins" }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::room::ConflictPolicy;
use crate::session::Permission;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Permission granted to joiners when no room says otherwise.
    pub default_permission: Permission,
    /// Buffered events per subscriber before slow subscribers lag.
    pub event_capacity: usize,
    /// Local operations leave the conflict window after this long without
    /// every peer acknowledging them. Default: 30s.
    pub ack_timeout_ms: u64,
    /// Unacknowledged local operations tracked per file. Oldest evicted first.
    pub max_pending_window: usize,
    /// Operations buffered per file while peers are unreachable.
    pub outbox_capacity: usize,
    /// Resolved conflicts remembered per file for reconciling late
    /// notices. Oldest forgotten first.
    pub max_resolved_conflicts: usize,
    /// Minimum gap between cursor-only presence broadcasts. Default: 33ms.
    pub cursor_broadcast_interval_ms: u64,
    /// Silent peers go `away` after this long...
    pub away_after_ms: u64,
    /// ...and `offline` after this long.
    pub offline_after_ms: u64,
    /// Auto-resolution for files no room scopes.
    pub conflict_policy: ConflictPolicy,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            default_permission: Permission::Write,
            event_capacity: 256,
            ack_timeout_ms: 30_000,
            max_pending_window: 1_000,
            outbox_capacity: 10_000,
            max_resolved_conflicts: 256,
            cursor_broadcast_interval_ms: 33, // 30fps
            away_after_ms: 60_000,
            offline_after_ms: 300_000,
            conflict_policy: ConflictPolicy::Manual,
        }
    }
}

impl CollabConfig {
    /// Config for testing (small buffers, no cursor throttling).
    pub fn for_testing() -> Self {
        Self {
            event_capacity: 64,
            ack_timeout_ms: 1_000,
            max_pending_window: 16,
            outbox_capacity: 64,
            max_resolved_conflicts: 8,
            cursor_broadcast_interval_ms: 0,
            away_after_ms: 100,
            offline_after_ms: 500,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        log::info!("Loaded collaboration config from {}", path.display());
        Ok(config)
    }
}
