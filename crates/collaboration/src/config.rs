use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for collaborative sessions.
///
/// Defaults mirror the production settings of the hosted service; every field
/// can be overridden from the environment with [`CollaborationConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationConfig {
    /// Take a snapshot after this many committed operations
    pub snapshot_interval_ops: usize,
    /// Take a snapshot at least this often while the document changes
    pub snapshot_period_secs: u64,
    /// Snapshots retained in memory per document
    pub history_capacity: usize,
    /// Undo entries kept per user
    pub undo_capacity: usize,
    /// Maximum concurrently present users per document
    pub max_room_size: usize,
    /// Operations accepted per user per minute
    pub rate_limit_ops_per_min: u32,
    /// Active users with no edit or cursor move for this long become idle
    pub idle_threshold_secs: u64,
    /// Users with no heartbeat for this long are disconnected
    pub liveness_timeout_secs: u64,
    /// Minimum spacing of cursor broadcasts per user
    pub cursor_interval_ms: u64,
    /// How long an out-of-order submission waits for its predecessor
    pub gap_timeout_ms: u64,
    /// First retry delay after a failed snapshot save
    pub snapshot_retry_base_ms: u64,
    /// Upper bound for the snapshot retry delay
    pub snapshot_retry_max_ms: u64,
    /// Session actors shut down after being empty this long
    pub empty_session_timeout_secs: u64,
    /// Housekeeping tick of the session actor
    pub tick_interval_ms: u64,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ops: 50,
            snapshot_period_secs: 60,
            history_capacity: 20,
            undo_capacity: 100,
            max_room_size: 50,
            rate_limit_ops_per_min: 120,
            idle_threshold_secs: 60,
            liveness_timeout_secs: 300,
            cursor_interval_ms: 33,
            gap_timeout_ms: 5_000,
            snapshot_retry_base_ms: 1_000,
            snapshot_retry_max_ms: 60_000,
            empty_session_timeout_secs: 30,
            tick_interval_ms: 1_000,
        }
    }
}

impl CollaborationConfig {
    /// Defaults overridden by `COLLAB_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        override_from_env("COLLAB_SNAPSHOT_INTERVAL", &mut cfg.snapshot_interval_ops);
        override_from_env("COLLAB_SNAPSHOT_PERIOD_SECS", &mut cfg.snapshot_period_secs);
        override_from_env("COLLAB_HISTORY_CAPACITY", &mut cfg.history_capacity);
        override_from_env("COLLAB_UNDO_CAPACITY", &mut cfg.undo_capacity);
        override_from_env("COLLAB_MAX_ROOM_SIZE", &mut cfg.max_room_size);
        override_from_env("COLLAB_RATE_LIMIT_OPS_PER_MIN", &mut cfg.rate_limit_ops_per_min);
        override_from_env("COLLAB_IDLE_THRESHOLD_SECS", &mut cfg.idle_threshold_secs);
        override_from_env("COLLAB_LIVENESS_TIMEOUT_SECS", &mut cfg.liveness_timeout_secs);
        override_from_env("COLLAB_CURSOR_INTERVAL_MS", &mut cfg.cursor_interval_ms);
        override_from_env("COLLAB_GAP_TIMEOUT_MS", &mut cfg.gap_timeout_ms);
        override_from_env("COLLAB_SNAPSHOT_RETRY_BASE_MS", &mut cfg.snapshot_retry_base_ms);
        override_from_env("COLLAB_SNAPSHOT_RETRY_MAX_MS", &mut cfg.snapshot_retry_max_ms);
        override_from_env(
            "COLLAB_EMPTY_SESSION_TIMEOUT_SECS",
            &mut cfg.empty_session_timeout_secs,
        );
        override_from_env("COLLAB_TICK_INTERVAL_MS", &mut cfg.tick_interval_ms);
        cfg
    }

    pub fn snapshot_period(&self) -> Duration {
        Duration::from_secs(self.snapshot_period_secs)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        seconds(self.idle_threshold_secs)
    }

    pub fn liveness_timeout(&self) -> chrono::Duration {
        seconds(self.liveness_timeout_secs)
    }

    pub fn cursor_interval(&self) -> chrono::Duration {
        milliseconds(self.cursor_interval_ms)
    }

    pub fn gap_timeout(&self) -> chrono::Duration {
        milliseconds(self.gap_timeout_ms)
    }

    pub fn snapshot_retry_base(&self) -> Duration {
        Duration::from_millis(self.snapshot_retry_base_ms)
    }

    pub fn snapshot_retry_max(&self) -> Duration {
        Duration::from_millis(self.snapshot_retry_max_ms)
    }

    pub fn empty_session_timeout(&self) -> Duration {
        Duration::from_secs(self.empty_session_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

// Settings too large for a chrono duration mean "never"
fn seconds(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn milliseconds(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn override_from_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(target = "config", key, value = %raw, "ignoring unparseable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_service_settings() {
        let cfg = CollaborationConfig::default();
        assert_eq!(cfg.snapshot_interval_ops, 50);
        assert_eq!(cfg.max_room_size, 50);
        assert_eq!(cfg.rate_limit_ops_per_min, 120);
        assert!(cfg.liveness_timeout() > cfg.idle_threshold());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: CollaborationConfig =
            serde_json::from_str(r#"{ "max_room_size": 4, "undo_capacity": 3 }"#).unwrap();
        assert_eq!(cfg.max_room_size, 4);
        assert_eq!(cfg.undo_capacity, 3);
        assert_eq!(cfg.history_capacity, 20);
    }

    #[test]
    fn test_huge_timeouts_saturate() {
        let cfg = CollaborationConfig {
            idle_threshold_secs: u64::MAX,
            liveness_timeout_secs: i64::MAX as u64,
            cursor_interval_ms: u64::MAX,
            gap_timeout_ms: i64::MAX as u64,
            ..CollaborationConfig::default()
        };
        assert_eq!(cfg.idle_threshold(), chrono::Duration::MAX);
        assert_eq!(cfg.liveness_timeout(), chrono::Duration::MAX);
        assert_eq!(cfg.cursor_interval(), chrono::Duration::MAX);
        assert_eq!(cfg.gap_timeout(), chrono::Duration::MAX);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("COLLAB_HISTORY_CAPACITY", "7");
        std::env::set_var("COLLAB_UNDO_CAPACITY", "not-a-number");
        let cfg = CollaborationConfig::from_env();
        assert_eq!(cfg.history_capacity, 7);
        assert_eq!(cfg.undo_capacity, 100);
        std::env::remove_var("COLLAB_HISTORY_CAPACITY");
        std::env::remove_var("COLLAB_UNDO_CAPACITY");
    }
}
