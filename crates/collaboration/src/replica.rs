/// Client-side replica of a shared document
/// Applies local edits optimistically and reconciles them with the session
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};

use crate::{
    apply_in_place, transform, CollaborationError, Comment, CommentAction, CommentId, Content,
    CursorPosition, DocumentId, DocumentState, Envelope, FieldPath, Operation, OperationId,
    OperationKind, PresenceUpdate, Result, Snapshot, SyncMessage, User, UserId,
};

/// Something the user asked the session to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Submission {
    Operation(Operation),
    Undo,
    Redo,
}

/// A submission with the sequence number it is sent under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub seq: u64,
    pub submission: Submission,
}

impl PendingSubmission {
    fn operation(&self) -> Option<&Operation> {
        match &self.submission {
            Submission::Operation(op) => Some(op),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Remote(Operation),
    Ack { seq: u64 },
}

// Inbound ordering: committed operations and operation acks take the version
// slot they fill, undo/redo acks wait until their steps have been applied.
const RANK_VERSION: u8 = 0;
const RANK_AFTER: u8 = 1;

/// One user's view of a document.
///
/// `local` is always `confirmed` with the in-flight submission and the
/// buffered ones applied on top. Only one submission is in flight at a time;
/// it is the only one the session may have seen.
pub struct Replica {
    user: User,
    confirmed: DocumentState,
    local: Content,
    inflight: Option<PendingSubmission>,
    buffer: VecDeque<PendingSubmission>,
    next_seq: u64,
    inbound: BTreeMap<(u64, u8), Inbound>,
    outbox: VecDeque<Envelope>,
    joined: bool,
    resyncing: bool,

    /// Highest submission the session had delivered when we last joined
    delivered_seq: Option<u64>,

    users: HashMap<UserId, User>,
    cursors: HashMap<UserId, CursorPosition>,
    warnings: Vec<String>,
}

impl Replica {
    pub fn new(document_id: DocumentId, user: User) -> Self {
        Self::from_parts(DocumentState::new(document_id), user, 1, Vec::new())
    }

    /// Rebuild a replica from persisted state; the first pending submission
    /// is treated as possibly sent
    pub(crate) fn from_parts(
        confirmed: DocumentState,
        user: User,
        next_seq: u64,
        pending: Vec<PendingSubmission>,
    ) -> Self {
        let mut pending: VecDeque<PendingSubmission> = pending.into();
        let mut replica = Self {
            user,
            local: confirmed.content.clone(),
            confirmed,
            inflight: pending.pop_front(),
            buffer: pending,
            next_seq: next_seq.max(1),
            inbound: BTreeMap::new(),
            outbox: VecDeque::new(),
            joined: false,
            resyncing: false,
            delivered_seq: None,
            users: HashMap::new(),
            cursors: HashMap::new(),
            warnings: Vec::new(),
        };
        replica.rebuild_local();
        replica
    }

    pub fn document_id(&self) -> DocumentId {
        self.confirmed.document_id
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// What the user sees
    pub fn content(&self) -> &Content {
        &self.local
    }

    pub fn text(&self) -> &str {
        &self.local.text
    }

    /// Last state acknowledged by the session
    pub fn confirmed(&self) -> &DocumentState {
        &self.confirmed
    }

    pub fn confirmed_version(&self) -> u64 {
        self.confirmed.version
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    /// Submissions not yet acknowledged, in-flight first
    pub fn pending(&self) -> Vec<PendingSubmission> {
        self.inflight
            .iter()
            .chain(self.buffer.iter())
            .cloned()
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inflight.iter().count() + self.buffer.len()
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn cursor_of(&self, user_id: &UserId) -> Option<CursorPosition> {
        self.cursors.get(user_id).copied()
    }

    /// Messages to hand to the transport, in order
    pub fn take_outgoing(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    /// Warnings for the UI (rejections, dropped work, server errors)
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Start (or restart) the handshake
    pub fn connect(&mut self) {
        self.joined = false;
        self.inbound.clear();
        let next_seq = self
            .inflight
            .as_ref()
            .or(self.buffer.front())
            .map_or(self.next_seq, |p| p.seq);
        self.push(
            SyncMessage::Join {
                user: self.user.clone(),
                next_seq,
            },
            0,
        );
    }

    pub fn leave(&mut self) {
        self.push(SyncMessage::Leave, 0);
        self.joined = false;
    }

    pub fn heartbeat(&mut self) {
        self.push(SyncMessage::Heartbeat, 0);
    }

    pub fn move_cursor(&mut self, cursor: CursorPosition) {
        self.push(SyncMessage::Cursor { cursor }, 0);
    }

    pub fn insert(&mut self, position: usize, text: impl Into<String>) -> Result<OperationId> {
        self.local_change(OperationKind::insert(position, text))
    }

    pub fn delete(&mut self, position: usize, length: usize) -> Result<OperationId> {
        self.local_change(OperationKind::delete(position, length))
    }

    pub fn update(
        &mut self,
        path: FieldPath,
        value: Option<Value>,
        data_type: Option<&str>,
    ) -> Result<OperationId> {
        self.local_change(OperationKind::Update {
            path,
            value,
            data_type: data_type.map(str::to_string),
        })
    }

    pub fn add_comment(&mut self, anchor: usize, text: impl Into<String>) -> Result<CommentId> {
        let comment = Comment::new(self.document_id(), self.user.id, anchor, text);
        let comment_id = comment.comment_id;
        self.local_change(OperationKind::Comment {
            action: CommentAction::Add { comment },
        })?;
        Ok(comment_id)
    }

    pub fn resolve_comment(&mut self, comment_id: CommentId, resolved: bool) -> Result<OperationId> {
        self.local_change(OperationKind::Comment {
            action: CommentAction::Resolve {
                comment_id,
                resolved,
            },
        })
    }

    pub fn remove_comment(&mut self, comment_id: CommentId) -> Result<OperationId> {
        self.local_change(OperationKind::Comment {
            action: CommentAction::Remove { comment_id },
        })
    }

    /// Ask the session to undo our latest operation; returns the sequence
    /// number of the request
    pub fn undo(&mut self) -> u64 {
        self.enqueue(Submission::Undo)
    }

    pub fn redo(&mut self) -> u64 {
        self.enqueue(Submission::Redo)
    }

    fn local_change(&mut self, kind: OperationKind) -> Result<OperationId> {
        let op = Operation::new(self.document_id(), self.user.id, self.confirmed.version, kind);
        op.validate(self.document_id())?;
        let op = op.normalize(&self.local);
        op.apply_to(&mut self.local);
        let id = op.id;
        self.enqueue(Submission::Operation(op));
        Ok(id)
    }

    fn enqueue(&mut self, submission: Submission) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let submission = match submission {
            Submission::Operation(op) => Submission::Operation(op.with_seq(seq)),
            other => other,
        };
        self.buffer.push_back(PendingSubmission { seq, submission });
        self.flush();
        seq
    }

    /// Cancel a buffered operation that has not been sent yet
    pub fn withdraw(&mut self, id: OperationId) -> Result<()> {
        if self.inflight.as_ref().and_then(|p| p.operation()).map(|op| op.id) == Some(id) {
            return Err(CollaborationError::InvalidOp(
                "operation was already sent".to_string(),
            ));
        }
        let index = self
            .buffer
            .iter()
            .position(|p| p.operation().map(|op| op.id) == Some(id))
            .ok_or_else(|| CollaborationError::NotFound(format!("pending operation {}", id.0)))?;

        let mut scratch = self.confirmed.content.clone();
        for pending in self.inflight.iter().chain(self.buffer.iter().take(index)) {
            if let Some(op) = pending.operation() {
                op.apply_to(&mut scratch);
            }
        }
        let Some(removed) = self.buffer.remove(index) else {
            return Ok(());
        };
        if let Submission::Operation(op) = removed.submission {
            for kind in op.apply_to(&mut scratch) {
                let step = op.with_kind(kind);
                rebase_entries(self.buffer.iter_mut().skip(index), &step)?;
            }
        }
        self.rebuild_local();
        debug!(operation = %id.0, "withdrew buffered operation");
        Ok(())
    }

    /// Handle one message from the session
    pub fn receive(&mut self, envelope: Envelope) {
        if envelope.document_id != self.document_id() {
            warn!(document = %envelope.document_id, "message for another document");
            return;
        }
        match envelope.message {
            SyncMessage::Joined {
                snapshot,
                delivered_seq,
                users,
            } => self.on_joined(snapshot, delivered_seq, users),
            SyncMessage::Operation {
                operation,
                version: Some(version),
            }
            | SyncMessage::Comment {
                operation,
                version: Some(version),
            } => {
                self.inbound
                    .insert((version, RANK_VERSION), Inbound::Remote(operation));
                self.drain_inbound();
            }
            SyncMessage::Ack { seq, version } => self.on_ack(seq, version),
            SyncMessage::Reject { seq, reason } => self.on_reject(seq, reason),
            SyncMessage::Resync {
                snapshot,
                operations,
            } => self.on_resync(snapshot, operations),
            SyncMessage::ResyncRequired { expected_seq } => {
                warn!(expected_seq, "session lost our submissions");
                if let Some(pending) = self.inflight.clone() {
                    if pending.seq >= expected_seq {
                        self.send(&pending);
                    }
                }
            }
            SyncMessage::Presence { update } => self.on_presence(update),
            SyncMessage::Error { message } => self.warn(message),
            other => debug!(message = other.name(), "ignoring message"),
        }
    }

    /// Ask for the committed tail after our confirmed version
    pub fn request_resync(&mut self) {
        self.resyncing = true;
        self.push(
            SyncMessage::ResyncRequest {
                since: self.confirmed.version,
            },
            0,
        );
    }

    fn on_joined(&mut self, snapshot: Snapshot, delivered_seq: u64, users: Vec<User>) {
        self.joined = true;
        self.users = users.into_iter().map(|u| (u.id, u)).collect();
        self.cursors.clear();

        if self.pending_len() == 0 {
            self.confirmed = snapshot.restore();
            self.local = self.confirmed.content.clone();
            self.next_seq = self.next_seq.max(delivered_seq + 1);
            return;
        }

        let inflight_delivered = self
            .inflight
            .as_ref()
            .map_or(false, |p| p.seq <= delivered_seq);
        if snapshot.version == self.confirmed.version && !inflight_delivered {
            self.resend_or_flush();
            return;
        }

        self.delivered_seq = Some(delivered_seq);
        self.request_resync();
    }

    fn on_ack(&mut self, seq: u64, version: u64) {
        let Some(pending) = &self.inflight else {
            debug!(seq, "ack without submission in flight");
            return;
        };
        if pending.seq != seq {
            debug!(seq, inflight = pending.seq, "stale ack");
            return;
        }
        let rank = match pending.submission {
            Submission::Operation(_) => RANK_VERSION,
            Submission::Undo | Submission::Redo => RANK_AFTER,
        };
        self.inbound.insert((version, rank), Inbound::Ack { seq });
        self.drain_inbound();
    }

    fn drain_inbound(&mut self) {
        while let Some(entry) = self.inbound.first_entry() {
            let (version, rank) = *entry.key();
            let next = self.confirmed.version + 1;
            let ready = match rank {
                RANK_VERSION => version <= next,
                _ => version <= self.confirmed.version,
            };
            if !ready {
                break;
            }
            let inbound = entry.remove();
            if rank == RANK_VERSION && version < next {
                debug!(version, "dropping already applied message");
                continue;
            }

            match inbound {
                Inbound::Remote(op) => {
                    if let Err(err) = self.apply_remote(&op) {
                        warn!(error = %err, "cannot integrate remote operation");
                        self.request_resync();
                        return;
                    }
                }
                Inbound::Ack { seq } => self.on_confirmed(seq),
            }
        }
    }

    fn apply_remote(&mut self, op: &Operation) -> Result<()> {
        let visible = rebase_entries(self.inflight.iter_mut().chain(self.buffer.iter_mut()), op)?;
        apply_in_place(&mut self.confirmed, op);
        visible.apply_to(&mut self.local);
        Ok(())
    }

    fn on_confirmed(&mut self, seq: u64) {
        let Some(pending) = self.inflight.take() else {
            return;
        };
        if pending.seq != seq {
            self.inflight = Some(pending);
            return;
        }
        if let Submission::Operation(op) = pending.submission {
            apply_in_place(&mut self.confirmed, &op);
            self.rebuild_local();
        }
        self.flush();
    }

    fn on_reject(&mut self, seq: u64, reason: String) {
        let Some(pending) = self.inflight.take() else {
            return;
        };
        if pending.seq != seq {
            self.inflight = Some(pending);
            return;
        }

        self.warn(format!("submission {seq} rejected: {reason}"));
        if let Submission::Operation(op) = pending.submission {
            if let Err(err) = self.retract(&op) {
                warn!(error = %err, "cannot retract rejected operation");
                self.request_resync();
                return;
            }
        }
        self.flush();
    }

    /// Take back an operation the session never committed. `op` must be
    /// expressed against the confirmed state.
    fn retract(&mut self, op: &Operation) -> Result<()> {
        let mut scratch = self.confirmed.content.clone();
        for kind in op.apply_to(&mut scratch) {
            let step = op.with_kind(kind);
            rebase_entries(self.buffer.iter_mut(), &step)?;
        }
        self.rebuild_local();
        Ok(())
    }

    fn on_resync(&mut self, snapshot: Snapshot, operations: Vec<Operation>) {
        let tail_end = snapshot.version + operations.len() as u64;
        let covered = snapshot.version <= self.confirmed.version && tail_end >= self.confirmed.version;

        if covered {
            if let Err(err) = self.replay_tail(snapshot.version, operations) {
                warn!(error = %err, "resync replay failed, dropping pending work");
                self.drop_pending();
            }
        } else {
            let mut state = snapshot.restore();
            for op in &operations {
                apply_in_place(&mut state, op);
            }
            self.confirmed = state;
            self.drop_pending();
        }

        self.delivered_seq = None;
        self.resyncing = false;
        let confirmed = self.confirmed.version;
        self.inbound.retain(|&(version, _), _| version > confirmed);
        self.rebuild_local();
        self.resend_or_flush();
        self.drain_inbound();
    }

    fn replay_tail(&mut self, snapshot_version: u64, operations: Vec<Operation>) -> Result<()> {
        let delivered = self.delivered_seq;
        let was_delivered = |p: &PendingSubmission| delivered.map_or(false, |d| p.seq <= d);

        // Delivered but never committed: it was rejected while we were away
        if let Some(pending) = self.inflight.clone() {
            if let Some(op) = pending.operation() {
                if was_delivered(&pending) && !operations.iter().any(|o| o.id == op.id) {
                    self.inflight = None;
                    self.warn(format!("submission {} was rejected", pending.seq));
                    self.retract(op)?;
                }
            }
        }

        let skip = (self.confirmed.version - snapshot_version) as usize;
        for op in operations.into_iter().skip(skip) {
            let ours = self
                .inflight
                .as_ref()
                .and_then(|p| p.operation())
                .map_or(false, |inflight| inflight.id == op.id);
            if ours {
                apply_in_place(&mut self.confirmed, &op);
                self.inflight = None;
            } else {
                self.apply_remote(&op)?;
            }
        }

        if let Some(pending) = &self.inflight {
            if pending.operation().is_none() && was_delivered(pending) {
                self.inflight = None;
            }
        }
        Ok(())
    }

    fn drop_pending(&mut self) {
        let dropped = self.pending_len();
        if dropped > 0 {
            self.warn(format!("dropped {dropped} pending submissions after resync"));
        }
        self.inflight = None;
        self.buffer.clear();
    }

    fn on_presence(&mut self, update: PresenceUpdate) {
        match update {
            PresenceUpdate::UserJoined { user } => {
                self.users.insert(user.id, user);
            }
            PresenceUpdate::UserLeft { user_id } => {
                self.users.remove(&user_id);
                self.cursors.remove(&user_id);
            }
            PresenceUpdate::CursorMoved { user_id, cursor } => {
                self.cursors.insert(user_id, cursor);
            }
            PresenceUpdate::UserIdle { .. } | PresenceUpdate::UserActive { .. } => {}
        }
    }

    fn rebuild_local(&mut self) {
        let mut local = self.confirmed.content.clone();
        for pending in self.inflight.iter().chain(self.buffer.iter()) {
            if let Some(op) = pending.operation() {
                op.apply_to(&mut local);
            }
        }
        self.local = local;
    }

    /// Send the next buffered submission if nothing is in flight
    fn flush(&mut self) {
        if self.inflight.is_some() || !self.joined || self.resyncing {
            return;
        }
        let Some(mut pending) = self.buffer.pop_front() else {
            return;
        };
        if let Submission::Operation(op) = &mut pending.submission {
            op.base_version = self.confirmed.version;
        }
        self.send(&pending);
        self.inflight = Some(pending);
    }

    fn resend_or_flush(&mut self) {
        if !self.joined {
            return;
        }
        match self.inflight.as_mut() {
            Some(pending) => {
                if let Submission::Operation(op) = &mut pending.submission {
                    op.base_version = self.confirmed.version;
                }
                let pending = pending.clone();
                self.send(&pending);
            }
            None => self.flush(),
        }
    }

    fn send(&mut self, pending: &PendingSubmission) {
        let message = match &pending.submission {
            Submission::Operation(op) => SyncMessage::for_operation(op.clone(), None),
            Submission::Undo => SyncMessage::Undo,
            Submission::Redo => SyncMessage::Redo,
        };
        self.push(message, pending.seq);
    }

    fn push(&mut self, message: SyncMessage, seq: u64) {
        let envelope = Envelope::new(self.document_id(), self.user.id, message).with_seq(seq);
        self.outbox.push_back(envelope);
    }

    fn warn(&mut self, message: String) {
        warn!(document = %self.document_id(), user = %self.user.id, message = %message.clone(), "replica warning");
        self.warnings.push(message);
    }
}

/// Transform the operations among `entries` past `applied`, in order, and
/// return `applied` as it lands on top of all of them
fn rebase_entries<'a>(
    entries: impl Iterator<Item = &'a mut PendingSubmission>,
    applied: &Operation,
) -> Result<Operation> {
    let mut applied = applied.clone();
    for entry in entries {
        if let Submission::Operation(op) = &mut entry.submission {
            let rebased = transform(op, &applied)?;
            applied = transform(&applied, op)?;
            *op = rebased;
        }
    }
    Ok(applied)
}
