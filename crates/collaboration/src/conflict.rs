/// Conflict detection and resolution for concurrent field updates
use serde::{Deserialize, Serialize};

use crate::{
    patch_value, value_at, CommentAction, CommentId, FieldPath, Operation, OperationKind, Span,
};

/// Represents a conflict between two concurrent operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// The two conflicting operations
    pub op1: Operation,
    pub op2: Operation,

    /// Type of conflict
    pub kind: ConflictKind,

    /// When the conflict was detected
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

/// Types of conflicts that can occur
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two users wrote the same field
    SamePath { path: FieldPath },

    /// One user wrote a field while another wrote inside it
    NestedPath {
        ancestor: FieldPath,
        descendant: FieldPath,
    },

    /// Two users inserted at the same position
    SamePositionInsert { position: usize },

    /// Two users deleted overlapping text
    OverlappingDelete,

    /// Two users changed the resolution of the same comment
    CommentResolution { comment_id: CommentId },
}

/// Result of conflict resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionResult {
    /// Use first operation, discard second
    UseFirst,

    /// Use second operation, discard first
    UseSecond,
}

/// Detect whether two concurrent operations compete for the same target.
pub fn detect_conflict(op1: &Operation, op2: &Operation) -> Option<Conflict> {
    let kind = classify_conflict(&op1.kind, &op2.kind)?;
    Some(Conflict {
        op1: op1.clone(),
        op2: op2.clone(),
        kind,
        detected_at: chrono::Utc::now(),
    })
}

fn classify_conflict(kind1: &OperationKind, kind2: &OperationKind) -> Option<ConflictKind> {
    use OperationKind::*;

    match (kind1, kind2) {
        (Update { path: p1, .. }, Update { path: p2, .. }) if p1 == p2 => {
            Some(ConflictKind::SamePath { path: p1.clone() })
        }
        (Update { path: p1, .. }, Update { path: p2, .. }) if p1.is_prefix_of(p2) => {
            Some(ConflictKind::NestedPath {
                ancestor: p1.clone(),
                descendant: p2.clone(),
            })
        }
        (Update { path: p1, .. }, Update { path: p2, .. }) if p2.is_prefix_of(p1) => {
            Some(ConflictKind::NestedPath {
                ancestor: p2.clone(),
                descendant: p1.clone(),
            })
        }
        (Insert { position: a, .. }, Insert { position: b, .. }) if a == b => {
            Some(ConflictKind::SamePositionInsert { position: *a })
        }
        (Delete { spans: s1 }, Delete { spans: s2 }) if spans_intersect(s1, s2) => {
            Some(ConflictKind::OverlappingDelete)
        }
        (
            Comment {
                action: CommentAction::Resolve { comment_id: c1, .. },
            },
            Comment {
                action: CommentAction::Resolve { comment_id: c2, .. },
            },
        ) if c1 == c2 => Some(ConflictKind::CommentResolution { comment_id: *c1 }),
        _ => None,
    }
}

fn spans_intersect(a: &[Span], b: &[Span]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.intersects(y)))
}

/// Last-write-wins: the operation with the greater order key prevails.
pub fn resolve(conflict: &Conflict) -> ResolutionResult {
    if conflict.op1.order_key() > conflict.op2.order_key() {
        ResolutionResult::UseFirst
    } else {
        ResolutionResult::UseSecond
    }
}

/// Returns whichever of two concurrent updates wins.
pub fn resolve_conflict<'a>(a: &'a Operation, b: &'a Operation) -> &'a Operation {
    if a.order_key() > b.order_key() {
        a
    } else {
        b
    }
}

/// Folds a set of concurrent updates pairwise in increasing key order.
pub fn resolve_all(ops: &[Operation]) -> Option<&Operation> {
    let mut sorted: Vec<&Operation> = ops.iter().collect();
    sorted.sort_by_key(|op| op.order_key());
    sorted
        .into_iter()
        .reduce(|winner, next| resolve_conflict(winner, next))
}

/// Transform update `op` against the already applied update `applied`.
///
/// Paths that do not overlap are independent. Otherwise the later writer
/// keeps its value at its own granularity:
/// * same path: the loser restates the winner's value;
/// * losing ancestor: its value is patched with the descendant's write;
/// * losing descendant: it restates what the ancestor's value holds there.
pub fn transform_update(op: &Operation, applied: &Operation) -> Operation {
    let (
        OperationKind::Update {
            path,
            value,
            data_type,
        },
        OperationKind::Update {
            path: applied_path,
            value: applied_value,
            ..
        },
    ) = (&op.kind, &applied.kind)
    else {
        return op.clone();
    };

    if !path.overlaps(applied_path) || op.order_key() > applied.order_key() {
        return op.clone();
    }

    let value = if let Some(rest) = applied_path.strip_prefix(path) {
        patch_value(value.clone(), rest, applied_value.clone())
    } else if let Some(rest) = path.strip_prefix(applied_path) {
        applied_value
            .as_ref()
            .and_then(|v| value_at(v, rest))
            .cloned()
    } else {
        value.clone()
    };

    tracing::debug!(
        path = %path,
        winner = %applied.author_id,
        "concurrent update lost to later writer"
    );

    op.with_kind(OperationKind::Update {
        path: path.clone(),
        value,
        data_type: data_type.clone(),
    })
}
