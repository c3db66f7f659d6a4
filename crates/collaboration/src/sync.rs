/// Message protocol exchanged between replicas and document sessions
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CursorPosition, DocumentId, Operation, PresenceUpdate, Result, Snapshot, User, UserId};

/// Sender id used for messages originated by the session itself
pub const SERVER_ID: UserId = UserId(Uuid::nil());

/// Transport envelope around every message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub document_id: DocumentId,
    pub sender_id: UserId,

    /// Per-sender submission number of sequenced messages, 0 otherwise
    #[serde(default)]
    pub seq: u64,

    pub message: SyncMessage,
}

impl Envelope {
    pub fn new(document_id: DocumentId, sender_id: UserId, message: SyncMessage) -> Self {
        Self {
            document_id,
            sender_id,
            seq: 0,
            message,
        }
    }

    pub fn from_server(document_id: DocumentId, message: SyncMessage) -> Self {
        Self::new(document_id, SERVER_ID, message)
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Message types exchanged between client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    // Connection management
    #[serde(rename = "join")]
    Join {
        user: User,
        /// Sequence number of the next submission this client will send
        #[serde(default = "first_seq")]
        next_seq: u64,
    },

    #[serde(rename = "joined")]
    Joined {
        snapshot: Snapshot,
        /// Highest submission of the joining user already delivered
        delivered_seq: u64,
        users: Vec<User>,
    },

    #[serde(rename = "leave")]
    Leave,

    #[serde(rename = "heartbeat")]
    Heartbeat,

    // Operation synchronization; `version` is set once committed
    #[serde(rename = "operation")]
    Operation {
        operation: Operation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },

    #[serde(rename = "comment")]
    Comment {
        operation: Operation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },

    #[serde(rename = "undo")]
    Undo,

    #[serde(rename = "redo")]
    Redo,

    #[serde(rename = "ack")]
    Ack { seq: u64, version: u64 },

    #[serde(rename = "reject")]
    Reject { seq: u64, reason: String },

    // Presence
    #[serde(rename = "cursor")]
    Cursor { cursor: CursorPosition },

    #[serde(rename = "presence")]
    Presence { update: PresenceUpdate },

    // Recovery
    #[serde(rename = "resync_request")]
    ResyncRequest { since: u64 },

    #[serde(rename = "resync")]
    Resync {
        snapshot: Snapshot,
        operations: Vec<Operation>,
    },

    #[serde(rename = "resync_required")]
    ResyncRequired { expected_seq: u64 },

    // Error handling
    #[serde(rename = "error")]
    Error { message: String },
}

fn first_seq() -> u64 {
    1
}

impl SyncMessage {
    /// Messages that consume a submission sequence number
    pub fn is_sequenced(&self) -> bool {
        matches!(
            self,
            SyncMessage::Operation { .. }
                | SyncMessage::Comment { .. }
                | SyncMessage::Undo
                | SyncMessage::Redo
        )
    }

    /// Comment operations travel as `comment`, everything else as `operation`
    pub fn for_operation(operation: Operation, version: Option<u64>) -> Self {
        if matches!(operation.kind, crate::OperationKind::Comment { .. }) {
            SyncMessage::Comment { operation, version }
        } else {
            SyncMessage::Operation { operation, version }
        }
    }

    /// Wrap a committed operation for broadcast
    pub fn committed(operation: Operation, version: u64) -> Self {
        Self::for_operation(operation, Some(version))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::Join { .. } => "join",
            SyncMessage::Joined { .. } => "joined",
            SyncMessage::Leave => "leave",
            SyncMessage::Heartbeat => "heartbeat",
            SyncMessage::Operation { .. } => "operation",
            SyncMessage::Comment { .. } => "comment",
            SyncMessage::Undo => "undo",
            SyncMessage::Redo => "redo",
            SyncMessage::Ack { .. } => "ack",
            SyncMessage::Reject { .. } => "reject",
            SyncMessage::Cursor { .. } => "cursor",
            SyncMessage::Presence { .. } => "presence",
            SyncMessage::ResyncRequest { .. } => "resync_request",
            SyncMessage::Resync { .. } => "resync",
            SyncMessage::ResyncRequired { .. } => "resync_required",
            SyncMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommentAction, Comment};

    #[test]
    fn test_envelope_wire_format() {
        let doc = DocumentId::new();
        let user = UserId::new();
        let op = Operation::insert(doc, user, 4, 0, "hi").with_seq(3);
        let envelope = Envelope::new(
            doc,
            user,
            SyncMessage::Operation {
                operation: op,
                version: None,
            },
        )
        .with_seq(3);

        let raw = envelope.to_json().unwrap();
        assert!(raw.contains(r#""type":"operation""#));
        assert!(!raw.contains("version\":null"));
        assert_eq!(Envelope::from_json(&raw).unwrap(), envelope);
    }

    #[test]
    fn test_join_defaults_next_seq() {
        let doc = DocumentId::new();
        let user = User::new(UserId::new(), "Ada");
        let raw = serde_json::json!({
            "document_id": doc,
            "sender_id": user.id,
            "message": { "type": "join", "user": user },
        })
        .to_string();

        let envelope = Envelope::from_json(&raw).unwrap();
        assert_eq!(envelope.seq, 0);
        assert!(matches!(
            envelope.message,
            SyncMessage::Join { next_seq: 1, .. }
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"document_id":"00000000-0000-0000-0000-000000000000","sender_id":"00000000-0000-0000-0000-000000000000","message":{"type":"teleport"}}"#;
        assert!(Envelope::from_json(raw).is_err());
    }

    #[test]
    fn test_committed_comment_uses_comment_message() {
        let doc = DocumentId::new();
        let user = UserId::new();
        let comment = Comment::new(doc, user, 0, "note");
        let op = Operation::comment(doc, user, 0, CommentAction::Add { comment });

        let message = SyncMessage::committed(op, 9);
        assert_eq!(message.name(), "comment");
        assert!(message.is_sequenced());
        assert!(!SyncMessage::Heartbeat.is_sequenced());
    }
}
