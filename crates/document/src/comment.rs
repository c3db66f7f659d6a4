use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{DocumentId, OrderKey, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a delete swallowed a text position.
///
/// `offset` counts the characters of that delete lying before the position,
/// so two positions collapsed by the same delete keep their original order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collapse {
    pub delete_id: Uuid,
    pub offset: usize,
}

/// Annotation anchored to a character position of the text region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: CommentId,
    pub document_id: DocumentId,
    pub author_id: UserId,
    pub text: String,
    pub anchor: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,

    /// Set once a delete covered the anchor. Only consulted when an insert
    /// lands exactly on the anchor, and ignored by equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapsed: Option<Collapse>,
}

impl PartialEq for Comment {
    fn eq(&self, other: &Self) -> bool {
        self.comment_id == other.comment_id
            && self.document_id == other.document_id
            && self.author_id == other.author_id
            && self.text == other.text
            && self.anchor == other.anchor
            && self.timestamp == other.timestamp
            && self.resolved == other.resolved
    }
}

impl Eq for Comment {}

impl Comment {
    pub fn new(
        document_id: DocumentId,
        author_id: UserId,
        anchor: usize,
        text: impl Into<String>,
    ) -> Self {
        Self {
            comment_id: CommentId::new(),
            document_id,
            author_id,
            text: text.into(),
            anchor,
            timestamp: Utc::now(),
            resolved: false,
            collapsed: None,
        }
    }

    /// Tie-break key used when an insert lands exactly on the anchor
    pub fn order_key(&self) -> OrderKey {
        OrderKey::new(self.timestamp, self.author_id, self.comment_id.0)
    }
}
