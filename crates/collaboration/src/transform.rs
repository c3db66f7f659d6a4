/// Operational transformation of concurrent operations
///
/// `transform(op, applied)` rewrites `op` so that applying it after `applied`
/// has the effect its author intended. For every supported pair:
///
/// `apply(apply(s, a), transform(b, a)) == apply(apply(s, b), transform(a, b))`
use crate::comments::move_anchor;
use crate::{
    transform_update, Collapse, CollaborationError, CommentAction, Operation, OperationId,
    OperationKind, OrderKey, Result, Span,
};

/// Moves a text position past `applied`.
///
/// A position equal to an insert point only moves when `stick_right` is set.
/// Positions inside a deleted range collapse to its start.
pub fn transform_position(position: usize, applied: &OperationKind, stick_right: bool) -> usize {
    match applied {
        OperationKind::Insert {
            position: at, text, ..
        } => {
            if position > *at || (position == *at && stick_right) {
                position.saturating_add(text.chars().count())
            } else {
                position
            }
        }
        OperationKind::Delete { spans } => position - deleted_before(position, spans),
        _ => position,
    }
}

fn deleted_before(position: usize, spans: &[Span]) -> usize {
    spans.iter().map(|s| s.covered_before(position)).sum()
}

/// Where `spans` swallow `position`, if a span covers or touches it.
pub(crate) fn collapse_of(position: usize, spans: &[Span], delete: OperationId) -> Option<Collapse> {
    spans
        .iter()
        .any(|s| s.position <= position && position <= s.end())
        .then(|| Collapse {
            delete_id: delete.0,
            offset: deleted_before(position, spans),
        })
}

fn spans_well_formed(spans: &[Span]) -> bool {
    spans.iter().all(|s| s.length > 0) && spans.windows(2).all(|w| w[0].end() < w[1].position)
}

/// Transform `op` against `applied`, which was committed first.
pub fn transform(op: &Operation, applied: &Operation) -> Result<Operation> {
    if op.document_id != applied.document_id {
        return Err(CollaborationError::Desync(format!(
            "cannot transform across documents {} and {}",
            op.document_id, applied.document_id
        )));
    }
    for candidate in [op, applied] {
        if let OperationKind::Delete { spans } = &candidate.kind {
            if !spans_well_formed(spans) {
                return Err(CollaborationError::Desync(format!(
                    "operation {} carries malformed spans",
                    candidate.id.0
                )));
            }
        }
    }

    let applied_key = applied.order_key();
    let kind = match (&op.kind, &applied.kind) {
        (
            OperationKind::Insert {
                position,
                text,
                collapsed,
            },
            OperationKind::Insert { .. },
        ) => {
            let wins_tie = op.order_key() > applied_key;
            OperationKind::Insert {
                position: transform_position(*position, &applied.kind, wins_tie),
                text: text.clone(),
                collapsed: *collapsed,
            }
        }

        (
            OperationKind::Insert {
                position,
                text,
                collapsed,
            },
            OperationKind::Delete { spans },
        ) => OperationKind::Insert {
            position: transform_position(*position, &applied.kind, false),
            text: text.clone(),
            collapsed: collapse_of(*position, spans, applied.id).or(*collapsed),
        },

        (
            OperationKind::Delete { spans },
            OperationKind::Insert {
                position: at, text, ..
            },
        ) => OperationKind::Delete {
            spans: split_around_insert(spans, *at, text.chars().count()),
        },

        (OperationKind::Delete { spans }, OperationKind::Delete { spans: removed }) => {
            OperationKind::Delete {
                spans: subtract_spans(spans, removed),
            }
        }

        (OperationKind::Update { .. }, OperationKind::Update { .. }) => {
            return Ok(transform_update(op, applied))
        }

        (OperationKind::Comment { action }, _) => OperationKind::Comment {
            action: transform_comment(action, &op.order_key(), applied),
        },

        // Comments never move text or fields, and updates are independent of text.
        _ => op.kind.clone(),
    };
    Ok(op.with_kind(kind))
}

/// Transforms an ordered sequence of operations against `applied`.
///
/// Returns the rebased sequence together with `applied` transformed past the
/// whole sequence, which is what a peer that already holds the sequence must
/// apply.
pub fn transform_sequence(
    ops: &[Operation],
    applied: &Operation,
) -> Result<(Vec<Operation>, Operation)> {
    let mut applied = applied.clone();
    let mut rebased = Vec::with_capacity(ops.len());
    for op in ops {
        let next = transform(op, &applied)?;
        applied = transform(&applied, op)?;
        rebased.push(next);
    }
    Ok((rebased, applied))
}

fn split_around_insert(spans: &[Span], at: usize, inserted: usize) -> Vec<Span> {
    let mut out = Vec::with_capacity(spans.len() + 1);
    for span in spans {
        if at <= span.position {
            out.push(Span::new(span.position.saturating_add(inserted), span.length));
        } else if at < span.end() {
            out.push(Span::new(span.position, at - span.position));
            out.push(Span::new(at.saturating_add(inserted), span.end() - at));
        } else {
            out.push(*span);
        }
    }
    out
}

fn subtract_spans(spans: &[Span], removed: &[Span]) -> Vec<Span> {
    let mut out: Vec<Span> = Vec::new();
    for span in spans {
        let mut pieces = vec![(span.position, span.end())];
        for cut in removed {
            pieces = pieces
                .into_iter()
                .flat_map(|(start, end)| {
                    let mut kept = Vec::with_capacity(2);
                    if cut.end() <= start || end <= cut.position {
                        kept.push((start, end));
                    } else {
                        if start < cut.position {
                            kept.push((start, cut.position));
                        }
                        if cut.end() < end {
                            kept.push((cut.end(), end));
                        }
                    }
                    kept
                })
                .collect();
        }
        for (start, end) in pieces {
            let mapped = start - deleted_before(start, removed);
            match out.last_mut() {
                Some(last) if last.end() >= mapped => last.length += end - start,
                _ => out.push(Span::new(mapped, end - start)),
            }
        }
    }
    out
}

fn transform_comment(action: &CommentAction, own_key: &OrderKey, applied: &Operation) -> CommentAction {
    match (action, &applied.kind) {
        (CommentAction::Add { comment }, kind) if kind.is_text() => {
            let mut comment = comment.clone();
            move_anchor(&mut comment, applied);
            CommentAction::Add { comment }
        }
        (
            CommentAction::Resolve { comment_id, .. },
            OperationKind::Comment {
                action:
                    CommentAction::Resolve {
                        comment_id: other,
                        resolved,
                    },
            },
        ) if comment_id == other && *own_key < applied.order_key() => CommentAction::Resolve {
            comment_id: *comment_id,
            resolved: *resolved,
        },
        _ => action.clone(),
    }
}
