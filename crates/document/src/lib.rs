use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

mod comment;
pub use comment::*;
mod path;
pub use path::*;
mod state;
pub use state::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("invalid field path: {0:?}")]
    InvalidPath(String),
    #[error("comment not found: {0}")]
    CommentNotFound(CommentId),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier shared by operations, comments and presence entries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Total order used to break ties between concurrent edits.
///
/// Compared lexicographically: wall-clock timestamp first, then the author,
/// then a per-item uuid so that two edits from the same author in the same
/// instant still order deterministically on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub timestamp: DateTime<Utc>,
    pub author_id: UserId,
    pub tiebreak: Uuid,
}

impl OrderKey {
    pub fn new(timestamp: DateTime<Utc>, author_id: UserId, tiebreak: Uuid) -> Self {
        Self {
            timestamp,
            author_id,
            tiebreak,
        }
    }
}
