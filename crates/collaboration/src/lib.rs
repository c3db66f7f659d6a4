/// Real-time collaborative editing core
/// Operational transformation, conflict resolution, versioned snapshots and
/// per-user undo for documents shared by many concurrent editors
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use document::{
    patch_value, value_at, Collapse, Comment, CommentId, Content, DocumentId, DocumentState,
    FieldPath, OrderKey, UserId,
};

mod config;
pub use config::*;

mod operations;
pub use operations::*;

mod transform;
pub use transform::*;

mod conflict;
pub use conflict::*;

mod comments;
pub use comments::*;

mod version;
pub use version::*;

mod presence;
pub use presence::*;

mod undo;
pub use undo::*;

mod causal;
pub use causal::*;

mod events;
pub use events::*;

mod valuation;
pub use valuation::*;

mod sync;
pub use sync::*;

mod session;
pub use session::*;

mod actor;
pub use actor::*;

mod registry;
pub use registry::*;

mod replica;
pub use replica::*;

mod offline;
pub use offline::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("malformed operation: {0}")]
    Malformed(String),

    #[error("document desync: {0}")]
    Desync(String),

    #[error("undo target was modified by another user: {0}")]
    StaleUndo(String),

    #[error("history empty: {0}")]
    HistoryEmpty(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("room is full ({0} users)")]
    RoomFull(usize),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("user not in session: {0}")]
    NotJoined(UserId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("session closed: {0}")]
    SessionClosed(DocumentId),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid operation: {0}")]
    InvalidOp(String),
}

impl From<serde_json::Error> for CollaborationError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CollaborationError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<document::DocumentError> for CollaborationError {
    fn from(err: document::DocumentError) -> Self {
        Self::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}
