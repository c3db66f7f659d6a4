/// Per-user undo/redo over a shared, concurrently edited document
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::{
    transform, CollaborationError, DocumentId, Operation, OperationKind, OperationLog, Result,
    UserId,
};

/// Steps that revert a committed operation, captured when it was applied
#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    pub operation: Operation,

    /// Applied in order, these restore the state before `operation`
    pub inverse: Vec<OperationKind>,

    /// Document version right after `operation` was committed; `inverse`
    /// is expressed in that version's coordinates
    pub recorded_at: u64,
}

#[derive(Debug, Default)]
struct UserHistory {
    undo_stack: VecDeque<UndoEntry>,
    redo_stack: VecDeque<UndoEntry>,
}

/// Bounded undo and redo stacks for every user of a document
#[derive(Debug)]
pub struct UndoManager {
    capacity: usize,
    users: HashMap<UserId, UserHistory>,
}

impl UndoManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            users: HashMap::new(),
        }
    }

    /// Record a new local operation; invalidates the user's redo stack
    pub fn record(&mut self, user_id: UserId, entry: UndoEntry) {
        let capacity = self.capacity;
        let history = self.users.entry(user_id).or_default();
        push_bounded(&mut history.undo_stack, entry, capacity);
        history.redo_stack.clear();
    }

    pub fn pop_undo(&mut self, user_id: &UserId) -> Result<UndoEntry> {
        self.users
            .get_mut(user_id)
            .and_then(|h| h.undo_stack.pop_back())
            .ok_or(CollaborationError::HistoryEmpty("undo stack"))
    }

    pub fn pop_redo(&mut self, user_id: &UserId) -> Result<UndoEntry> {
        self.users
            .get_mut(user_id)
            .and_then(|h| h.redo_stack.pop_back())
            .ok_or(CollaborationError::HistoryEmpty("redo stack"))
    }

    /// Entry that reverts a committed undo
    pub fn push_redo(&mut self, user_id: UserId, entry: UndoEntry) {
        let capacity = self.capacity;
        let history = self.users.entry(user_id).or_default();
        push_bounded(&mut history.redo_stack, entry, capacity);
    }

    /// Entry that reverts a committed redo; keeps the rest of the redo stack
    pub fn push_undo(&mut self, user_id: UserId, entry: UndoEntry) {
        let capacity = self.capacity;
        let history = self.users.entry(user_id).or_default();
        push_bounded(&mut history.undo_stack, entry, capacity);
    }

    pub fn can_undo(&self, user_id: &UserId) -> bool {
        self.users
            .get(user_id)
            .map_or(false, |h| !h.undo_stack.is_empty())
    }

    pub fn can_redo(&self, user_id: &UserId) -> bool {
        self.users
            .get(user_id)
            .map_or(false, |h| !h.redo_stack.is_empty())
    }

    pub fn undo_depth(&self, user_id: &UserId) -> usize {
        self.users.get(user_id).map_or(0, |h| h.undo_stack.len())
    }

    /// Oldest version some entry still needs to rebase from
    pub fn oldest_recorded(&self) -> Option<u64> {
        self.users
            .values()
            .flat_map(|h| h.undo_stack.iter().chain(h.redo_stack.iter()))
            .map(|e| e.recorded_at)
            .min()
    }

    pub fn clear_user(&mut self, user_id: &UserId) {
        self.users.remove(user_id);
    }
}

fn push_bounded(stack: &mut VecDeque<UndoEntry>, entry: UndoEntry, capacity: usize) {
    stack.push_back(entry);
    while stack.len() > capacity {
        stack.pop_front();
    }
}

/// Rebase an entry's inverse steps over everything committed since it was
/// recorded.
///
/// Fails with `StaleUndo` when another user's operation touched the region,
/// field or comment the steps would restore.
pub fn rebase_inverse(
    entry: &UndoEntry,
    log: &OperationLog,
    document_id: DocumentId,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<Vec<Operation>> {
    let mut steps: Vec<Operation> = entry
        .inverse
        .iter()
        .map(|kind| {
            Operation::new(document_id, user_id, entry.recorded_at, kind.clone()).with_timestamp(now)
        })
        .collect();

    let committed = log.since(entry.recorded_at).map_err(|_| {
        CollaborationError::StaleUndo(format!(
            "history before version {} is no longer available",
            entry.recorded_at
        ))
    })?;

    for op in committed {
        let foreign = op.author_id != user_id;
        let mut applied = op.clone();
        let mut rebased = Vec::with_capacity(steps.len());
        for step in &steps {
            if foreign && touches(&step.kind, &applied.kind) {
                return Err(CollaborationError::StaleUndo(format!(
                    "{} by {} overlaps the {} being restored",
                    applied.kind.name(),
                    applied.author_id,
                    step.kind.name()
                )));
            }
            rebased.push(transform(step, &applied)?);
            applied = transform(&applied, step)?;
        }
        steps = rebased;
    }

    Ok(steps.into_iter().filter(|s| !s.kind.is_noop()).collect())
}

/// Whether `other` modified the target `step` restores
fn touches(step: &OperationKind, other: &OperationKind) -> bool {
    use OperationKind::*;

    match (step, other) {
        (Insert { position: p, .. }, Insert { position: q, .. }) => p == q,
        (Insert { position, .. }, Delete { spans }) => {
            spans.iter().any(|s| s.contains_interior(*position))
        }
        (Delete { spans }, Insert { position, .. }) => {
            spans.iter().any(|s| s.contains_interior(*position))
        }
        (Delete { spans: a }, Delete { spans: b }) => {
            a.iter().any(|x| b.iter().any(|y| x.intersects(y)))
        }
        (Update { path: a, .. }, Update { path: b, .. }) => a.overlaps(b),
        (Comment { action: a }, Comment { action: b }) => a.comment_id() == b.comment_id(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{apply_in_place, Content, DocumentState, FieldPath};
    use serde_json::json;

    fn commit(state: &mut DocumentState, log: &mut OperationLog, op: Operation) -> UndoEntry {
        let op = op.with_base_version(state.version);
        let inverse = apply_in_place(state, &op);
        let recorded_at = log.append(op.clone());
        UndoEntry {
            operation: op,
            inverse,
            recorded_at,
        }
    }

    #[test]
    fn test_stacks_are_bounded_and_redo_cleared() {
        let doc = DocumentId::new();
        let user = UserId::new();
        let mut manager = UndoManager::new(2);
        let entry = |n: u64| UndoEntry {
            operation: Operation::insert(doc, user, n, 0, "x"),
            inverse: vec![OperationKind::delete(0, 1)],
            recorded_at: n,
        };

        manager.record(user, entry(1));
        manager.record(user, entry(2));
        manager.record(user, entry(3));
        assert_eq!(manager.undo_depth(&user), 2);
        assert_eq!(manager.oldest_recorded(), Some(2));

        let popped = manager.pop_undo(&user).unwrap();
        assert_eq!(popped.recorded_at, 3);
        manager.push_redo(user, popped);
        assert!(manager.can_redo(&user));

        manager.record(user, entry(4));
        assert!(!manager.can_redo(&user));
        assert!(matches!(
            manager.pop_redo(&user),
            Err(CollaborationError::HistoryEmpty(_))
        ));
    }

    #[test]
    fn test_rebase_over_unrelated_edit() {
        let mut state = DocumentState::with_content(DocumentId::new(), Content::with_text("Hello"));
        let doc = state.document_id;
        let mut log = OperationLog::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let entry = commit(&mut state, &mut log, Operation::insert(doc, alice, 0, 5, " World"));
        commit(&mut state, &mut log, Operation::insert(doc, bob, 0, 0, ">> "));

        let steps = rebase_inverse(&entry, &log, doc, alice, Utc::now()).unwrap();
        for step in &steps {
            apply_in_place(&mut state, step);
        }
        assert_eq!(state.content.text, ">> Hello");
    }

    #[test]
    fn test_overlapping_foreign_edit_is_stale() {
        let mut state = DocumentState::with_content(DocumentId::new(), Content::with_text("abc"));
        let doc = state.document_id;
        let mut log = OperationLog::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let entry = commit(&mut state, &mut log, Operation::insert(doc, alice, 0, 3, "defgh"));
        commit(&mut state, &mut log, Operation::delete(doc, bob, 0, 4, 2));

        assert!(matches!(
            rebase_inverse(&entry, &log, doc, alice, Utc::now()),
            Err(CollaborationError::StaleUndo(_))
        ));
    }

    #[test]
    fn test_foreign_update_on_same_field_is_stale() {
        let mut state = DocumentState::new(DocumentId::new());
        let doc = state.document_id;
        let mut log = OperationLog::new();
        let alice = UserId::new();
        let path = FieldPath::parse("dcf.wacc").unwrap();

        let entry = commit(
            &mut state,
            &mut log,
            Operation::update(doc, alice, 0, path.clone(), Some(json!(0.08))),
        );
        commit(
            &mut state,
            &mut log,
            Operation::update(doc, UserId::new(), 0, path, Some(json!(0.09))),
        );

        assert!(rebase_inverse(&entry, &log, doc, alice, Utc::now()).is_err());
    }

    #[test]
    fn test_own_later_edits_are_not_stale() {
        let mut state = DocumentState::with_content(DocumentId::new(), Content::with_text("abc"));
        let doc = state.document_id;
        let mut log = OperationLog::new();
        let alice = UserId::new();

        let entry = commit(&mut state, &mut log, Operation::delete(doc, alice, 0, 0, 2));
        commit(&mut state, &mut log, Operation::insert(doc, alice, 0, 0, "xy"));

        let later = Utc::now() + chrono::Duration::seconds(1);
        let steps = rebase_inverse(&entry, &log, doc, alice, later).unwrap();
        for step in &steps {
            apply_in_place(&mut state, step);
        }
        assert_eq!(state.content.text, "xyabc");
    }
}
