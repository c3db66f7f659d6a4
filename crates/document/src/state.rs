use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Comment, CommentId, DocumentId};

/// Materialized content of a collaborative document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// Free-text region; positions address characters, not bytes
    #[serde(default)]
    pub text: String,

    /// Keyed model inputs (assumptions, scenario values, ...)
    #[serde(default)]
    pub fields: Map<String, Value>,

    /// Anchored annotations ordered by their order key
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Content {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_fields(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Length of the text region in characters
    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Inserts `text` at character `position`, clamped to the end of the region.
    /// Returns the position actually used.
    pub fn insert_text(&mut self, position: usize, text: &str) -> usize {
        let position = position.min(self.text_len());
        let byte = self.byte_offset(position);
        self.text.insert_str(byte, text);
        position
    }

    /// Removes up to `length` characters starting at `position` and returns them.
    pub fn remove_text(&mut self, position: usize, length: usize) -> String {
        let total = self.text_len();
        let start = position.min(total);
        let end = position.saturating_add(length).min(total);
        let (from, to) = (self.byte_offset(start), self.byte_offset(end));
        self.text.drain(from..to).collect()
    }

    pub fn comment(&self, comment_id: CommentId) -> Option<&Comment> {
        self.comments.iter().find(|c| c.comment_id == comment_id)
    }

    pub fn comment_mut(&mut self, comment_id: CommentId) -> Option<&mut Comment> {
        self.comments.iter_mut().find(|c| c.comment_id == comment_id)
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.text
            .char_indices()
            .nth(chars)
            .map(|(idx, _)| idx)
            .unwrap_or(self.text.len())
    }
}

/// Point-in-time state of one document replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub document_id: DocumentId,

    /// Number of committed operations reflected in `content`
    pub version: u64,

    pub content: Content,
}

impl DocumentState {
    pub fn new(document_id: DocumentId) -> Self {
        Self::with_content(document_id, Content::default())
    }

    pub fn with_content(document_id: DocumentId, content: Content) -> Self {
        Self {
            document_id,
            version: 0,
            content,
        }
    }
}
