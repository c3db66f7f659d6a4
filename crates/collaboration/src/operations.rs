/// Collaborative document operations
/// These operations represent changes that can be synchronized across users
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::{
    apply_comment_operation, shift_anchors, transform_position, Collapse, CollaborationError,
    CommentAction, Content, DocumentId, DocumentState, FieldPath, OperationId, OrderKey, Result,
    UserId,
};

/// Contiguous character range of the text region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub position: usize,
    pub length: usize,
}

impl Span {
    pub fn new(position: usize, length: usize) -> Self {
        Self { position, length }
    }

    pub fn end(&self) -> usize {
        self.position.saturating_add(self.length)
    }

    /// Number of characters of this span that lie before `position`
    pub fn covered_before(&self, position: usize) -> usize {
        position.saturating_sub(self.position).min(self.length)
    }

    pub fn intersects(&self, other: &Span) -> bool {
        self.position < other.end() && other.position < self.end()
    }

    /// True when `position` lies strictly inside the span
    pub fn contains_interior(&self, position: usize) -> bool {
        self.position < position && position < self.end()
    }
}

/// Sorts, clamps to `text_len`, drops empty spans and merges touching ones.
pub fn normalize_spans(mut spans: Vec<Span>, text_len: usize) -> Vec<Span> {
    spans.sort_by_key(|s| s.position);
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        let start = span.position.min(text_len);
        let end = span.end().min(text_len);
        if end <= start {
            continue;
        }
        match merged.last_mut() {
            Some(last) if start <= last.end() => {
                last.length = last.length.max(end - last.position);
            }
            _ => merged.push(Span::new(start, end - start)),
        }
    }
    merged
}

/// Kind of change carried by an [`Operation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    /// Insert `text` before the character at `position`
    Insert {
        position: usize,
        text: String,

        /// Set when a concurrent delete swallowed `position`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collapsed: Option<Collapse>,
    },

    /// Remove the characters covered by `spans`.
    ///
    /// Spans are ascending, disjoint and never touch. A freshly created delete
    /// has a single span; transforming it against a concurrent insert inside
    /// its range splits it. An empty list is a no-op.
    Delete { spans: Vec<Span> },

    /// Set a structured field; `None` clears it
    Update {
        path: FieldPath,
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_type: Option<String>,
    },

    /// Add, resolve or remove an anchored comment
    Comment { action: CommentAction },
}

impl OperationKind {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        OperationKind::Insert {
            position,
            text: text.into(),
            collapsed: None,
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        OperationKind::Delete {
            spans: vec![Span::new(position, length)],
        }
    }

    pub fn update(path: FieldPath, value: Option<Value>) -> Self {
        OperationKind::Update {
            path,
            value,
            data_type: None,
        }
    }

    /// Operations that address the text region
    pub fn is_text(&self) -> bool {
        matches!(self, OperationKind::Insert { .. } | OperationKind::Delete { .. })
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, OperationKind::Delete { spans } if spans.is_empty())
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Insert { .. } => "insert",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Update { .. } => "update",
            OperationKind::Comment { .. } => "comment",
        }
    }
}

/// Document operation that can be replicated across users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,

    pub document_id: DocumentId,

    /// User who created this operation
    pub author_id: UserId,

    /// Author's submission sequence number, 1-based and gap-free
    #[serde(default)]
    pub seq: u64,

    /// Document version the author saw when creating the operation
    pub base_version: u64,

    /// Timestamp when operation was created (client time)
    pub timestamp: DateTime<Utc>,

    /// The actual operation
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(
        document_id: DocumentId,
        author_id: UserId,
        base_version: u64,
        kind: OperationKind,
    ) -> Self {
        Self {
            id: OperationId::new(),
            document_id,
            author_id,
            seq: 0,
            base_version,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn insert(
        document_id: DocumentId,
        author_id: UserId,
        base_version: u64,
        position: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            document_id,
            author_id,
            base_version,
            OperationKind::insert(position, text),
        )
    }

    pub fn delete(
        document_id: DocumentId,
        author_id: UserId,
        base_version: u64,
        position: usize,
        length: usize,
    ) -> Self {
        Self::new(
            document_id,
            author_id,
            base_version,
            OperationKind::delete(position, length),
        )
    }

    pub fn update(
        document_id: DocumentId,
        author_id: UserId,
        base_version: u64,
        path: FieldPath,
        value: Option<Value>,
    ) -> Self {
        Self::new(
            document_id,
            author_id,
            base_version,
            OperationKind::update(path, value),
        )
    }

    pub fn comment(
        document_id: DocumentId,
        author_id: UserId,
        base_version: u64,
        action: CommentAction,
    ) -> Self {
        Self::new(
            document_id,
            author_id,
            base_version,
            OperationKind::Comment { action },
        )
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_base_version(mut self, base_version: u64) -> Self {
        self.base_version = base_version;
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        if let OperationKind::Update {
            data_type: ref mut slot,
            ..
        } = self.kind
        {
            *slot = Some(data_type.into());
        }
        self
    }

    /// Same identity and metadata carrying a different change
    pub fn with_kind(&self, kind: OperationKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey::new(self.timestamp, self.author_id, self.id.0)
    }

    /// Reject operations that can never be applied meaningfully.
    ///
    /// Only fresh submissions are validated; transformed operations may
    /// legitimately carry an empty span list.
    pub fn validate(&self, document_id: DocumentId) -> Result<()> {
        if self.document_id != document_id {
            return Err(CollaborationError::Malformed(format!(
                "operation {} targets document {}",
                self.id.0, self.document_id
            )));
        }
        match &self.kind {
            OperationKind::Insert { text, .. } if text.is_empty() => Err(
                CollaborationError::Malformed("insert with empty text".to_string()),
            ),
            OperationKind::Insert { .. } => Ok(()),
            OperationKind::Delete { spans } => validate_spans(spans),
            OperationKind::Update { .. } => Ok(()),
            OperationKind::Comment { action } => action.validate(document_id),
        }
    }

    /// Clamp targets to `content` so the committed log only holds in-range
    /// operations.
    pub fn normalize(&self, content: &Content) -> Operation {
        let text_len = content.text_len();
        let kind = match &self.kind {
            OperationKind::Insert {
                position,
                text,
                collapsed,
            } => OperationKind::Insert {
                position: (*position).min(text_len),
                text: text.clone(),
                collapsed: *collapsed,
            },
            OperationKind::Delete { spans } => OperationKind::Delete {
                spans: normalize_spans(spans.clone(), text_len),
            },
            OperationKind::Comment {
                action: CommentAction::Add { comment },
            } => {
                let mut comment = comment.clone();
                comment.anchor = comment.anchor.min(text_len);
                OperationKind::Comment {
                    action: CommentAction::Add { comment },
                }
            }
            other => other.clone(),
        };
        self.with_kind(kind)
    }

    /// Apply this operation to `content` and return the steps that revert it,
    /// in the order they must be applied.
    ///
    /// Never fails: out-of-range positions are clamped and actions on missing
    /// comments do nothing.
    pub fn apply_to(&self, content: &mut Content) -> Vec<OperationKind> {
        match &self.kind {
            OperationKind::Insert {
                position,
                text,
                collapsed,
            } => {
                if text.is_empty() {
                    return Vec::new();
                }
                let used = content.insert_text(*position, text);
                let inserted = OperationKind::Insert {
                    position: used,
                    text: text.clone(),
                    collapsed: *collapsed,
                };
                shift_anchors(&mut content.comments, &self.with_kind(inserted));
                vec![OperationKind::delete(used, text.chars().count())]
            }

            OperationKind::Delete { spans } => {
                let spans = normalize_spans(spans.clone(), content.text_len());
                let mut restored = Vec::with_capacity(spans.len());
                for span in spans.iter().rev() {
                    let removed = content.remove_text(span.position, span.length);
                    restored.push(OperationKind::insert(span.position, removed));
                }
                let applied = OperationKind::Delete { spans };
                shift_anchors(&mut content.comments, &self.with_kind(applied));
                restored.reverse();
                restored
            }

            OperationKind::Update {
                path,
                value,
                data_type,
            } => {
                let (undo_path, previous) = path.set(&mut content.fields, value.clone());
                vec![OperationKind::Update {
                    path: undo_path,
                    value: previous,
                    data_type: data_type.clone(),
                }]
            }

            OperationKind::Comment { action } => apply_comment_operation(content, action)
                .map(|inverse| OperationKind::Comment { action: inverse })
                .into_iter()
                .collect(),
        }
    }

    /// Moves a text position (cursor, selection end) past this operation.
    pub fn map_position(&self, position: usize, stick_right: bool) -> usize {
        transform_position(position, &self.kind, stick_right)
    }
}

fn validate_spans(spans: &[Span]) -> Result<()> {
    if spans.is_empty() {
        return Err(CollaborationError::Malformed(
            "delete without spans".to_string(),
        ));
    }
    if spans.iter().any(|s| s.length == 0) {
        return Err(CollaborationError::Malformed(
            "delete with zero-length span".to_string(),
        ));
    }
    if spans.iter().any(|s| s.position.checked_add(s.length).is_none()) {
        return Err(CollaborationError::Malformed(
            "delete span ends past the addressable range".to_string(),
        ));
    }
    if spans.windows(2).any(|w| w[1].position <= w[0].end()) {
        return Err(CollaborationError::Malformed(
            "delete spans must be ascending and disjoint".to_string(),
        ));
    }
    Ok(())
}

/// Applies `op` to a copy of `state`, advancing its version.
pub fn apply(state: &DocumentState, op: &Operation) -> DocumentState {
    let mut next = state.clone();
    apply_in_place(&mut next, op);
    next
}

/// Applies `op` to `state`, advances the version and returns the inverse steps.
pub fn apply_in_place(state: &mut DocumentState, op: &Operation) -> Vec<OperationKind> {
    let inverse = op.apply_to(&mut state.content);
    state.version += 1;
    inverse
}

/// Append-only log of committed operations.
///
/// The operation at index `i` was committed as version `base_version + i + 1`.
/// A log re-seeded from a snapshot starts at that snapshot's version.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    base_version: u64,

    operations: Vec<Operation>,

    /// Index by operation ID for fast lookup
    operation_index: HashMap<OperationId, usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(base_version: u64) -> Self {
        Self {
            base_version,
            operations: Vec::new(),
            operation_index: HashMap::new(),
        }
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Version produced by the last committed operation
    pub fn head_version(&self) -> u64 {
        self.base_version + self.operations.len() as u64
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append a committed operation and return its version
    pub fn append(&mut self, op: Operation) -> u64 {
        self.operation_index.insert(op.id, self.operations.len());
        self.operations.push(op);
        self.head_version()
    }

    pub fn get_operation(&self, id: &OperationId) -> Option<&Operation> {
        self.operation_index
            .get(id)
            .and_then(|&idx| self.operations.get(idx))
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.operation_index.contains_key(id)
    }

    /// Committed version of an operation still held by the log
    pub fn version_of(&self, id: &OperationId) -> Option<u64> {
        self.operation_index
            .get(id)
            .map(|&idx| self.base_version + idx as u64 + 1)
    }

    /// Operations committed after `version`, oldest first
    pub fn since(&self, version: u64) -> Result<&[Operation]> {
        if version < self.base_version {
            return Err(CollaborationError::Desync(format!(
                "version {version} precedes log base {}",
                self.base_version
            )));
        }
        let start = (version - self.base_version) as usize;
        self.operations.get(start..).ok_or_else(|| {
            CollaborationError::Desync(format!(
                "version {version} is ahead of log head {}",
                self.head_version()
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    /// Drop operations at or before `version`; the log then starts there.
    pub fn compact(&mut self, version: u64) {
        let version = version.min(self.head_version());
        if version <= self.base_version {
            return;
        }
        let dropped = (version - self.base_version) as usize;
        self.operations.drain(..dropped);
        self.base_version = version;
        self.operation_index = self
            .operations
            .iter()
            .enumerate()
            .map(|(idx, op)| (op.id, idx))
            .collect();
    }

    /// Bring `state` up to the head of the log
    pub fn replay(&self, state: &mut DocumentState) -> Result<()> {
        for op in self.since(state.version)? {
            apply_in_place(state, op);
        }
        Ok(())
    }
}
