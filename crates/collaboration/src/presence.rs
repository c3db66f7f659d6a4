/// User presence tracking for collaborative editing
/// Shows who is in a document, where their cursor is and whether they are idle
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{CollaborationConfig, Operation, UserId};

/// User information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub color: UserColor,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: UserColor::from_user_id(id),
        }
    }
}

/// Color assigned to a user for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Generate a color based on user ID (deterministic)
    pub fn from_user_id(user_id: UserId) -> Self {
        let bytes = user_id.0.as_bytes();
        Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Caret and optional selection in the text region, in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub position: usize,

    /// Other end of the selection, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
}

impl CursorPosition {
    pub fn at(position: usize) -> Self {
        Self {
            position,
            selection_end: None,
        }
    }

    fn shifted(self, op: &Operation, own: bool) -> Self {
        Self {
            position: op.map_position(self.position, own),
            selection_end: self.selection_end.map(|end| op.map_position(end, own)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// Registered, handshake not finished
    Joining,
    Active,
    Idle,
    /// Left explicitly; kept until the liveness sweep purges it
    Disconnected,
}

/// User's current state in a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user: User,
    pub cursor: Option<CursorPosition>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: PresenceState,

    #[serde(skip)]
    last_cursor_broadcast: Option<DateTime<Utc>>,
    #[serde(skip)]
    pending_cursor: Option<CursorPosition>,
}

impl PresenceEntry {
    fn new(user: User, now: DateTime<Utc>) -> Self {
        Self {
            user,
            cursor: None,
            last_heartbeat: now,
            last_activity: now,
            state: PresenceState::Joining,
            last_cursor_broadcast: None,
            pending_cursor: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.state != PresenceState::Disconnected
    }
}

/// Presence update message (sent via WebSocket and to UI subscribers)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PresenceUpdate {
    #[serde(rename = "user_joined")]
    UserJoined { user: User },

    #[serde(rename = "user_left")]
    UserLeft { user_id: UserId },

    #[serde(rename = "cursor_moved")]
    CursorMoved {
        user_id: UserId,
        cursor: CursorPosition,
    },

    #[serde(rename = "user_idle")]
    UserIdle { user_id: UserId },

    #[serde(rename = "user_active")]
    UserActive { user_id: UserId },
}

/// Presence manager tracks all users of one document.
///
/// Every method takes the current time explicitly; the session actor drives
/// it from its tick.
#[derive(Debug, Clone)]
pub struct PresenceManager {
    users: HashMap<UserId, PresenceEntry>,
    idle_threshold: chrono::Duration,
    liveness_timeout: chrono::Duration,
    cursor_interval: chrono::Duration,
}

impl PresenceManager {
    pub fn new(config: &CollaborationConfig) -> Self {
        Self {
            users: HashMap::new(),
            idle_threshold: config.idle_threshold(),
            liveness_timeout: config.liveness_timeout(),
            cursor_interval: config.cursor_interval(),
        }
    }

    /// Register a user. Re-adding a present user only refreshes its heartbeat.
    pub fn add_user(&mut self, user: User, now: DateTime<Utc>) -> Vec<PresenceUpdate> {
        match self.users.get_mut(&user.id) {
            Some(entry) if entry.is_present() => {
                entry.last_heartbeat = now;
                Vec::new()
            }
            _ => {
                let update = PresenceUpdate::UserJoined { user: user.clone() };
                self.users.insert(user.id, PresenceEntry::new(user, now));
                vec![update]
            }
        }
    }

    /// Finish the handshake of a joining user
    pub fn activate(&mut self, user_id: &UserId, now: DateTime<Utc>) {
        if let Some(entry) = self.users.get_mut(user_id) {
            if entry.state == PresenceState::Joining {
                entry.state = PresenceState::Active;
                entry.last_activity = now;
            }
        }
    }

    /// Mark a user as gone. Idempotent: only the first call reports `UserLeft`.
    pub fn remove_user(&mut self, user_id: &UserId) -> Vec<PresenceUpdate> {
        match self.users.get_mut(user_id) {
            Some(entry) if entry.is_present() => {
                entry.state = PresenceState::Disconnected;
                entry.cursor = None;
                entry.pending_cursor = None;
                vec![PresenceUpdate::UserLeft { user_id: *user_id }]
            }
            _ => Vec::new(),
        }
    }

    /// Liveness signal; returns false for users that are not present
    pub fn heartbeat(&mut self, user_id: &UserId, now: DateTime<Utc>) -> bool {
        match self.users.get_mut(user_id) {
            Some(entry) if entry.is_present() => {
                entry.last_heartbeat = now;
                true
            }
            _ => false,
        }
    }

    /// Edits and cursor moves count as activity and wake idle users
    pub fn record_activity(&mut self, user_id: &UserId, now: DateTime<Utc>) -> Vec<PresenceUpdate> {
        let Some(entry) = self.users.get_mut(user_id).filter(|e| e.is_present()) else {
            return Vec::new();
        };
        entry.last_activity = now;
        entry.last_heartbeat = now;
        if entry.state == PresenceState::Idle {
            entry.state = PresenceState::Active;
            return vec![PresenceUpdate::UserActive { user_id: *user_id }];
        }
        Vec::new()
    }

    /// Store a cursor move; broadcasts at most once per cursor interval and
    /// keeps only the newest pending position in between.
    pub fn update_cursor(
        &mut self,
        user_id: &UserId,
        cursor: CursorPosition,
        now: DateTime<Utc>,
    ) -> Vec<PresenceUpdate> {
        let mut updates = self.record_activity(user_id, now);
        let interval = self.cursor_interval;
        let Some(entry) = self.users.get_mut(user_id).filter(|e| e.is_present()) else {
            return updates;
        };

        entry.cursor = Some(cursor);
        let due = entry
            .last_cursor_broadcast
            .map_or(true, |last| now - last >= interval);
        if due {
            entry.last_cursor_broadcast = Some(now);
            entry.pending_cursor = None;
            updates.push(PresenceUpdate::CursorMoved {
                user_id: *user_id,
                cursor,
            });
        } else {
            entry.pending_cursor = Some(cursor);
        }
        updates
    }

    /// Emit coalesced cursor moves whose interval has elapsed
    pub fn flush_cursors(&mut self, now: DateTime<Utc>) -> Vec<PresenceUpdate> {
        let interval = self.cursor_interval;
        let mut updates = Vec::new();
        for (user_id, entry) in self.users.iter_mut() {
            let due = entry
                .last_cursor_broadcast
                .map_or(true, |last| now - last >= interval);
            if !due {
                continue;
            }
            if let Some(cursor) = entry.pending_cursor.take() {
                entry.last_cursor_broadcast = Some(now);
                updates.push(PresenceUpdate::CursorMoved {
                    user_id: *user_id,
                    cursor,
                });
            }
        }
        updates
    }

    /// Periodic sweep: idles inactive users and purges users whose heartbeat
    /// expired. Each purged user that had not left explicitly yields exactly
    /// one `UserLeft`.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<PresenceUpdate> {
        let mut updates = Vec::new();
        let liveness = self.liveness_timeout;
        let idle = self.idle_threshold;

        self.users.retain(|user_id, entry| {
            if now - entry.last_heartbeat > liveness {
                if entry.is_present() {
                    tracing::info!(user = %user_id, "presence expired");
                    updates.push(PresenceUpdate::UserLeft { user_id: *user_id });
                }
                return false;
            }
            if entry.state == PresenceState::Active && now - entry.last_activity > idle {
                entry.state = PresenceState::Idle;
                updates.push(PresenceUpdate::UserIdle { user_id: *user_id });
            }
            true
        });
        updates
    }

    /// Move every stored cursor past a committed text operation
    pub fn shift_cursors(&mut self, op: &Operation) {
        if !op.kind.is_text() {
            return;
        }
        for (user_id, entry) in self.users.iter_mut() {
            let own = *user_id == op.author_id;
            entry.cursor = entry.cursor.map(|c| c.shifted(op, own));
            entry.pending_cursor = entry.pending_cursor.map(|c| c.shifted(op, own));
        }
    }

    pub fn get_user(&self, user_id: &UserId) -> Option<&PresenceEntry> {
        self.users.get(user_id)
    }

    pub fn is_present(&self, user_id: &UserId) -> bool {
        self.users.get(user_id).map_or(false, PresenceEntry::is_present)
    }

    /// Users that have not left
    pub fn present_users(&self) -> Vec<&PresenceEntry> {
        self.users.values().filter(|e| e.is_present()).collect()
    }

    pub fn present_count(&self) -> usize {
        self.users.values().filter(|e| e.is_present()).count()
    }

    /// Get all users including disconnected entries awaiting purge
    pub fn get_all_users(&self) -> Vec<&PresenceEntry> {
        self.users.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DocumentId;
    use chrono::Duration;

    fn manager() -> PresenceManager {
        PresenceManager::new(&CollaborationConfig::default())
    }

    #[test]
    fn test_user_color_from_id() {
        let user_id = UserId::new();
        let color = UserColor::from_user_id(user_id);

        let hex = color.to_hex();
        assert!(hex.starts_with('#'));
        assert_eq!(hex.len(), 7);
        assert_eq!(color, UserColor::from_user_id(user_id));
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut presence = manager();
        let now = Utc::now();
        let user = User::new(UserId::new(), "Alice");

        assert_eq!(presence.add_user(user.clone(), now).len(), 1);
        assert!(presence.add_user(user.clone(), now).is_empty());
        assert_eq!(
            presence.get_user(&user.id).unwrap().state,
            PresenceState::Joining
        );

        presence.activate(&user.id, now);
        assert_eq!(
            presence.get_user(&user.id).unwrap().state,
            PresenceState::Active
        );
    }

    #[test]
    fn test_leave_then_timeout_reports_once() {
        let mut presence = manager();
        let now = Utc::now();
        let user = User::new(UserId::new(), "Bob");
        presence.add_user(user.clone(), now);

        assert_eq!(
            presence.remove_user(&user.id),
            vec![PresenceUpdate::UserLeft { user_id: user.id }]
        );
        assert!(presence.remove_user(&user.id).is_empty());
        assert_eq!(presence.present_count(), 0);
        assert!(presence.get_user(&user.id).is_some());

        let later = now + Duration::seconds(301);
        assert!(presence.sweep(later).is_empty());
        assert!(presence.get_user(&user.id).is_none());
    }

    #[test]
    fn test_timeout_without_leave_reports_once() {
        let mut presence = manager();
        let now = Utc::now();
        let user = User::new(UserId::new(), "Carol");
        presence.add_user(user.clone(), now);
        presence.activate(&user.id, now);

        let idle = presence.sweep(now + Duration::seconds(61));
        assert_eq!(idle, vec![PresenceUpdate::UserIdle { user_id: user.id }]);

        let expired = presence.sweep(now + Duration::seconds(301));
        assert_eq!(expired, vec![PresenceUpdate::UserLeft { user_id: user.id }]);
        assert!(presence.sweep(now + Duration::seconds(400)).is_empty());
    }

    #[test]
    fn test_activity_wakes_idle_user() {
        let mut presence = manager();
        let now = Utc::now();
        let user = User::new(UserId::new(), "Dan");
        presence.add_user(user.clone(), now);
        presence.activate(&user.id, now);
        presence.sweep(now + Duration::seconds(61));

        let updates = presence.record_activity(&user.id, now + Duration::seconds(62));
        assert_eq!(updates, vec![PresenceUpdate::UserActive { user_id: user.id }]);
    }

    #[test]
    fn test_cursor_updates_are_coalesced() {
        let mut presence = manager();
        let now = Utc::now();
        let user = User::new(UserId::new(), "Eve");
        presence.add_user(user.clone(), now);
        presence.activate(&user.id, now);

        let first = presence.update_cursor(&user.id, CursorPosition::at(1), now);
        assert_eq!(first.len(), 1);

        let soon = now + Duration::milliseconds(10);
        assert!(presence
            .update_cursor(&user.id, CursorPosition::at(2), soon)
            .is_empty());
        assert!(presence
            .update_cursor(&user.id, CursorPosition::at(3), soon)
            .is_empty());
        assert!(presence.flush_cursors(soon).is_empty());

        let flushed = presence.flush_cursors(now + Duration::milliseconds(40));
        assert_eq!(
            flushed,
            vec![PresenceUpdate::CursorMoved {
                user_id: user.id,
                cursor: CursorPosition::at(3)
            }]
        );
        assert!(presence
            .flush_cursors(now + Duration::milliseconds(100))
            .is_empty());
    }

    #[test]
    fn test_cursors_follow_text_edits() {
        let mut presence = manager();
        let now = Utc::now();
        let (alice, bob) = (User::new(UserId::new(), "A"), User::new(UserId::new(), "B"));
        presence.add_user(alice.clone(), now);
        presence.add_user(bob.clone(), now);
        presence.update_cursor(&alice.id, CursorPosition::at(4), now);
        presence.update_cursor(&bob.id, CursorPosition::at(4), now);

        let op = Operation::insert(DocumentId::new(), alice.id, 0, 4, "xyz");
        presence.shift_cursors(&op);

        assert_eq!(
            presence.get_user(&alice.id).unwrap().cursor,
            Some(CursorPosition::at(7))
        );
        assert_eq!(
            presence.get_user(&bob.id).unwrap().cursor,
            Some(CursorPosition::at(4))
        );
    }
}
