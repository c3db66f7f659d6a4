/// Anchored comments on a shared document
use serde::{Deserialize, Serialize};

use crate::transform::collapse_of;
use crate::{
    transform_position, CollaborationError, Comment, CommentId, Content, DocumentId, Operation,
    OperationKind, Result,
};

/// Change to the comment set of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommentAction {
    Add { comment: Comment },
    Resolve { comment_id: CommentId, resolved: bool },
    Remove { comment_id: CommentId },
}

impl CommentAction {
    pub fn comment_id(&self) -> CommentId {
        match self {
            CommentAction::Add { comment } => comment.comment_id,
            CommentAction::Resolve { comment_id, .. } | CommentAction::Remove { comment_id } => {
                *comment_id
            }
        }
    }

    pub(crate) fn validate(&self, document_id: DocumentId) -> Result<()> {
        match self {
            CommentAction::Add { comment } if comment.document_id != document_id => {
                Err(CollaborationError::Malformed(format!(
                    "comment {} belongs to document {}",
                    comment.comment_id, comment.document_id
                )))
            }
            CommentAction::Add { comment } if comment.text.trim().is_empty() => Err(
                CollaborationError::Malformed("comment text is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Apply a comment action and return the action that reverts it.
///
/// Comments are kept sorted by order key, so concurrent adds end up in the
/// same order on every replica.
///
/// Adding an existing comment, or resolving/removing a missing one, leaves the
/// content untouched and returns `None`.
pub fn apply_comment_operation(content: &mut Content, action: &CommentAction) -> Option<CommentAction> {
    match action {
        CommentAction::Add { comment } => {
            if content.comment(comment.comment_id).is_some() {
                return None;
            }
            let mut comment = comment.clone();
            comment.anchor = comment.anchor.min(content.text_len());
            let comment_id = comment.comment_id;
            let key = comment.order_key();
            let index = content.comments.partition_point(|c| c.order_key() < key);
            content.comments.insert(index, comment);
            Some(CommentAction::Remove { comment_id })
        }
        CommentAction::Resolve {
            comment_id,
            resolved,
        } => {
            let comment = content.comment_mut(*comment_id)?;
            let previous = std::mem::replace(&mut comment.resolved, *resolved);
            Some(CommentAction::Resolve {
                comment_id: *comment_id,
                resolved: previous,
            })
        }
        CommentAction::Remove { comment_id } => {
            let idx = content
                .comments
                .iter()
                .position(|c| c.comment_id == *comment_id)?;
            let comment = content.comments.remove(idx);
            Some(CommentAction::Add { comment })
        }
    }
}

/// Moves stored anchors past an applied text operation.
pub fn shift_anchors(comments: &mut [Comment], applied: &Operation) {
    if !applied.kind.is_text() {
        return;
    }
    for comment in comments.iter_mut() {
        move_anchor(comment, applied);
    }
}

/// Moves one anchor past an applied text operation.
///
/// A delete covering or touching the anchor records where it collapsed. An
/// insert landing exactly on the anchor pushes it right when both were
/// collapsed by the same delete and the anchor started further right;
/// otherwise only when the comment orders after the insert. A concurrent
/// comment is transformed the same way, so stored and rebased anchors agree.
pub(crate) fn move_anchor(comment: &mut Comment, applied: &Operation) {
    match &applied.kind {
        OperationKind::Insert { collapsed, .. } => {
            let stick_right = match (comment.collapsed, collapsed) {
                (Some(mine), Some(theirs))
                    if mine.delete_id == theirs.delete_id && mine.offset != theirs.offset =>
                {
                    mine.offset > theirs.offset
                }
                _ => comment.order_key() > applied.order_key(),
            };
            comment.anchor = transform_position(comment.anchor, &applied.kind, stick_right);
        }
        OperationKind::Delete { spans } => {
            if let Some(collapse) = collapse_of(comment.anchor, spans, applied.id) {
                comment.collapsed = Some(collapse);
            }
            comment.anchor = transform_position(comment.anchor, &applied.kind, false);
        }
        _ => {}
    }
}

/// Comments of a document, oldest first.
pub fn list_comments(content: &Content, unresolved_only: bool) -> Vec<&Comment> {
    content
        .comments
        .iter()
        .filter(|c| !unresolved_only || !c.resolved)
        .collect()
}
