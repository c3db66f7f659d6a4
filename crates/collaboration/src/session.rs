/// Authoritative state of one shared document
/// Serializes every submission: transform, apply, log, fan out
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    apply_in_place, detect_conflict, rebase_inverse, transform, CausalInbox, CollaborationConfig,
    CollaborationError, CommentUpdateEvent, DataUpdateEvent, Delivery, DocumentId, DocumentState,
    Envelope, EventHub, FieldPath, Operation, OperationKind, OperationLog, PresenceManager,
    PresenceUpdate, Result, Snapshot, SyncMessage, UndoEntry, UndoManager, User, UserId,
    UserJoinedEvent, UserLeftEvent, ValuationRouter, VersionHistory, CursorUpdateEvent, SERVER_ID,
};

/// Outgoing channel of one connected peer
pub type PeerSender = mpsc::UnboundedSender<Envelope>;

/// Sliding one-minute window of accepted operations per user
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: HashMap<UserId, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    /// A limit of 0 disables limiting
    pub fn new(ops_per_minute: u32) -> Self {
        Self {
            limit: ops_per_minute as usize,
            window: Duration::minutes(1),
            hits: HashMap::new(),
        }
    }

    /// Count one operation; false once the user exhausted the window
    pub fn check(&mut self, user_id: UserId, now: DateTime<Utc>) -> bool {
        if self.limit == 0 {
            return true;
        }
        let window = self.window;
        let hits = self.hits.entry(user_id).or_default();
        while hits.front().map_or(false, |&at| now - at >= window) {
            hits.pop_front();
        }
        if hits.len() >= self.limit {
            return false;
        }
        hits.push_back(now);
        true
    }

    pub fn forget(&mut self, user_id: &UserId) {
        self.hits.remove(user_id);
    }
}

/// Session information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub document_id: DocumentId,
    pub version: u64,
    pub user_count: usize,
    pub users: Vec<User>,
    pub operation_count: usize,
    pub snapshot_versions: Vec<u64>,
}

/// Who receives the broadcast of a committed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    /// Everyone but the author, who already applied it optimistically
    Others,
    /// Server-built operations (undo steps, imports) go to the author too
    Everyone,
}

struct Committed {
    version: u64,
    operation: Operation,
    inverse: Vec<OperationKind>,
}

/// Single writer of one document.
///
/// Owned by exactly one session actor; nothing here is shared across tasks.
pub struct DocumentSession {
    state: DocumentState,
    log: OperationLog,
    history: VersionHistory,
    presence: PresenceManager,
    undo: UndoManager,
    inbox: CausalInbox<Envelope>,
    rate_limiter: RateLimiter,
    peers: HashMap<UserId, PeerSender>,
    events: EventHub,
    valuation: ValuationRouter,
    config: CollaborationConfig,
    ops_since_snapshot: usize,
    last_snapshot_at: DateTime<Utc>,

    /// Snapshots taken but not yet handed to the store
    unsaved: Vec<Snapshot>,
}

impl DocumentSession {
    /// Start a session at `state`, which becomes the first history entry
    pub fn new(
        state: DocumentState,
        config: CollaborationConfig,
        events: EventHub,
        valuation: ValuationRouter,
    ) -> Self {
        let mut history = VersionHistory::new(config.history_capacity);
        history.insert(Snapshot::capture(&state, None), state.version);

        Self {
            log: OperationLog::starting_at(state.version),
            history,
            presence: PresenceManager::new(&config),
            undo: UndoManager::new(config.undo_capacity),
            inbox: CausalInbox::new(config.gap_timeout()),
            rate_limiter: RateLimiter::new(config.rate_limit_ops_per_min),
            peers: HashMap::new(),
            events,
            valuation,
            ops_since_snapshot: 0,
            last_snapshot_at: Utc::now(),
            unsaved: Vec::new(),
            config,
            state,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.state.document_id
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn history(&self) -> &VersionHistory {
        &self.history
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    /// Operations committed since the last snapshot
    pub fn ops_since_snapshot(&self) -> usize {
        self.ops_since_snapshot
    }

    /// No user is present
    pub fn is_empty(&self) -> bool {
        self.presence.present_count() == 0
    }

    pub fn info(&self) -> SessionInfo {
        let users: Vec<User> = self
            .presence
            .present_users()
            .into_iter()
            .map(|entry| entry.user.clone())
            .collect();
        SessionInfo {
            document_id: self.document_id(),
            version: self.state.version,
            user_count: users.len(),
            users,
            operation_count: self.log.len(),
            snapshot_versions: self.history.versions(),
        }
    }

    /// Admit a user and send them the current state.
    ///
    /// `next_seq` is the first submission the client will (re)send; a client
    /// reconnecting with unacknowledged work uses the sequence number of that
    /// work so it is neither lost nor applied twice.
    pub fn join(
        &mut self,
        user: User,
        next_seq: u64,
        peer: PeerSender,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let user_id = user.id;
        if !self.presence.is_present(&user_id)
            && self.presence.present_count() >= self.config.max_room_size
        {
            warn!(document = %self.document_id(), user = %user_id, "room is full");
            return Err(CollaborationError::RoomFull(self.config.max_room_size));
        }

        let updates = self.presence.add_user(user.clone(), now);
        self.inbox.resume(user_id, next_seq);
        self.peers.insert(user_id, peer);

        let joined = SyncMessage::Joined {
            snapshot: Snapshot::capture(&self.state, None),
            delivered_seq: self.inbox.delivered().get(user_id),
            users: self
                .presence
                .present_users()
                .into_iter()
                .map(|entry| entry.user.clone())
                .collect(),
        };
        self.send_to(user_id, joined);
        self.presence.activate(&user_id, now);
        self.publish_presence(updates);

        info!(
            document = %self.document_id(),
            user = %user_id,
            name = %user.name,
            version = self.state.version,
            "user joined"
        );
        Ok(())
    }

    /// Explicit leave; the user is reported gone exactly once
    pub fn leave(&mut self, user_id: UserId) {
        let updates = self.presence.remove_user(&user_id);
        self.peers.remove(&user_id);
        self.rate_limiter.forget(&user_id);
        if !updates.is_empty() {
            info!(document = %self.document_id(), user = %user_id, "user left");
        }
        self.publish_presence(updates);
    }

    /// The connection dropped without a leave; presence expires on its own
    pub fn detach(&mut self, user_id: UserId) {
        if self.peers.remove(&user_id).is_some() {
            debug!(document = %self.document_id(), user = %user_id, "peer detached");
        }
    }

    /// Handle one message from a client. Errors are reported back to the
    /// sender as well as returned.
    pub fn receive(&mut self, envelope: Envelope, now: DateTime<Utc>) -> Result<()> {
        let sender = envelope.sender_id;
        let result = self.dispatch(envelope, now);
        if let Err(err) = &result {
            warn!(document = %self.document_id(), sender = %sender, error = %err, "message refused");
            self.send_to(
                sender,
                SyncMessage::Error {
                    message: err.to_string(),
                },
            );
        }
        result
    }

    fn dispatch(&mut self, envelope: Envelope, now: DateTime<Utc>) -> Result<()> {
        if envelope.document_id != self.document_id() {
            return Err(CollaborationError::Malformed(format!(
                "message addressed to document {}",
                envelope.document_id
            )));
        }
        let sender = envelope.sender_id;

        if envelope.message.is_sequenced() {
            self.ensure_present(&sender)?;
            if envelope.seq == 0 {
                return Err(CollaborationError::Malformed(format!(
                    "{} without a sequence number",
                    envelope.message.name()
                )));
            }
            let seq = envelope.seq;
            if let Delivery::Ready(ready) = self.inbox.accept(sender, seq, envelope, now) {
                for submission in ready {
                    self.process_submission(submission, now);
                }
            }
            return Ok(());
        }

        match envelope.message {
            SyncMessage::Leave => {
                self.leave(sender);
                Ok(())
            }
            SyncMessage::Heartbeat => {
                if self.presence.heartbeat(&sender, now) {
                    Ok(())
                } else {
                    Err(CollaborationError::NotJoined(sender))
                }
            }
            SyncMessage::Cursor { cursor } => {
                self.ensure_present(&sender)?;
                let updates = self.presence.update_cursor(&sender, cursor, now);
                self.publish_presence(updates);
                Ok(())
            }
            SyncMessage::ResyncRequest { since } => {
                self.ensure_present(&sender)?;
                debug!(document = %self.document_id(), user = %sender, since, "resync requested");
                let payload = self.resync_payload(since);
                self.send_to(sender, payload);
                Ok(())
            }
            other => Err(CollaborationError::InvalidOp(format!(
                "{} is not accepted from clients",
                other.name()
            ))),
        }
    }

    fn ensure_present(&self, user_id: &UserId) -> Result<()> {
        if self.presence.is_present(user_id) {
            Ok(())
        } else {
            Err(CollaborationError::NotJoined(*user_id))
        }
    }

    /// A causally ready submission: commit it and acknowledge or reject
    fn process_submission(&mut self, envelope: Envelope, now: DateTime<Utc>) {
        let sender = envelope.sender_id;
        let seq = envelope.seq;
        let outcome = match envelope.message {
            SyncMessage::Operation { operation, .. } | SyncMessage::Comment { operation, .. } => {
                if operation.author_id == sender {
                    self.submit(operation, now)
                } else {
                    Err(CollaborationError::Malformed(format!(
                        "operation authored by {} sent by {}",
                        operation.author_id, sender
                    )))
                }
            }
            SyncMessage::Undo => self.undo(sender, now),
            SyncMessage::Redo => self.redo(sender, now),
            _ => return,
        };

        match outcome {
            Ok(version) => self.send_to(sender, SyncMessage::Ack { seq, version }),
            Err(err) => {
                self.send_to(
                    sender,
                    SyncMessage::Reject {
                        seq,
                        reason: err.to_string(),
                    },
                );
                if matches!(err, CollaborationError::Desync(_)) {
                    self.resync_from_snapshot(sender);
                }
            }
        }
    }

    /// Validate, transform and commit a client operation.
    ///
    /// Returns the version it was committed as. Rejected operations never
    /// reach the log.
    pub fn submit(&mut self, operation: Operation, now: DateTime<Utc>) -> Result<u64> {
        let author = operation.author_id;
        operation.validate(self.document_id())?;
        if operation.base_version > self.state.version {
            return Err(CollaborationError::Malformed(format!(
                "base version {} is ahead of version {}",
                operation.base_version, self.state.version
            )));
        }
        if !self.rate_limiter.check(author, now) {
            return Err(CollaborationError::RateLimited(format!(
                "more than {} operations per minute",
                self.config.rate_limit_ops_per_min
            )));
        }

        let rebased = self.rebase(operation)?;
        let committed = self.commit(rebased, now, Audience::Others);
        self.undo.record(
            author,
            UndoEntry {
                operation: committed.operation,
                inverse: committed.inverse,
                recorded_at: committed.version,
            },
        );
        Ok(committed.version)
    }

    /// Transform `op` past everything committed after its base version
    fn rebase(&self, mut op: Operation) -> Result<Operation> {
        let concurrent = self.log.since(op.base_version).map_err(|err| {
            error!(
                document = %self.document_id(),
                operation = %op.id.0,
                base_version = op.base_version,
                error = %err,
                "cannot rebase operation"
            );
            err
        })?;

        for applied in concurrent {
            if let Some(conflict) = detect_conflict(&op, applied) {
                debug!(kind = ?conflict.kind, "resolving concurrent conflict");
            }
            op = transform(&op, applied)?;
        }
        Ok(op.with_base_version(self.state.version))
    }

    fn commit(&mut self, operation: Operation, now: DateTime<Utc>, audience: Audience) -> Committed {
        let operation = operation.normalize(&self.state.content);
        let inverse = apply_in_place(&mut self.state, &operation);
        let version = self.log.append(operation.clone());
        let author = operation.author_id;

        debug!(
            document = %self.document_id(),
            version,
            kind = operation.kind.name(),
            author = %author,
            "committed operation"
        );

        self.presence.shift_cursors(&operation);
        let woke = self.presence.record_activity(&author, now);
        self.publish_presence(woke);

        let document_id = self.document_id();
        match &operation.kind {
            OperationKind::Comment { action } => {
                self.events.emit_comment_update(CommentUpdateEvent {
                    document_id,
                    version,
                    action: action.clone(),
                })
            }
            _ => self.events.emit_data_update(DataUpdateEvent {
                document_id,
                version,
                operation: operation.clone(),
            }),
        }
        self.valuation.dispatch(&operation, version);

        let exclude = match audience {
            Audience::Others => Some(author),
            Audience::Everyone => None,
        };
        self.broadcast(
            author,
            SyncMessage::committed(operation.clone(), version),
            exclude,
        );

        self.ops_since_snapshot += 1;
        if self.ops_since_snapshot >= self.config.snapshot_interval_ops {
            self.create_snapshot(None, now);
        }

        Committed {
            version,
            operation,
            inverse,
        }
    }

    /// Commit rebased undo/redo steps; returns the final version and the
    /// steps that revert all of them, in application order
    fn commit_steps(&mut self, steps: Vec<Operation>, now: DateTime<Utc>) -> (u64, Vec<OperationKind>) {
        let mut inverses = Vec::with_capacity(steps.len());
        for step in steps {
            let step = step.with_base_version(self.state.version);
            inverses.push(self.commit(step, now, Audience::Everyone).inverse);
        }
        let inverse = inverses.into_iter().rev().flatten().collect();
        (self.state.version, inverse)
    }

    /// Revert the user's most recent operation that is still undoable
    pub fn undo(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<u64> {
        let entry = self.undo.pop_undo(&user_id)?;
        let steps = rebase_inverse(&entry, &self.log, self.document_id(), user_id, now)
            .map_err(|err| {
                info!(user = %user_id, error = %err, "dropping undo entry");
                err
            })?;

        let (version, inverse) = self.commit_steps(steps, now);
        self.undo.push_redo(
            user_id,
            UndoEntry {
                operation: entry.operation,
                inverse,
                recorded_at: version,
            },
        );
        Ok(version)
    }

    /// Re-apply the user's most recently undone operation
    pub fn redo(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<u64> {
        let entry = self.undo.pop_redo(&user_id)?;
        let steps = rebase_inverse(&entry, &self.log, self.document_id(), user_id, now)
            .map_err(|err| {
                info!(user = %user_id, error = %err, "dropping redo entry");
                err
            })?;

        let (version, inverse) = self.commit_steps(steps, now);
        self.undo.push_undo(
            user_id,
            UndoEntry {
                operation: entry.operation,
                inverse,
                recorded_at: version,
            },
        );
        Ok(version)
    }

    /// Snapshot the current version and queue it for persistence. The
    /// version is not bumped.
    pub fn create_snapshot(&mut self, author_id: Option<UserId>, now: DateTime<Utc>) -> Snapshot {
        let floor = self.replay_floor();
        let snapshot = self
            .history
            .create_snapshot(&self.state, author_id, floor)
            .clone();
        self.ops_since_snapshot = 0;
        self.last_snapshot_at = now;

        if let Some(oldest) = self.history.oldest() {
            self.log.compact(oldest.version.min(floor));
        }

        info!(document = %self.document_id(), version = snapshot.version, "snapshot created");
        self.unsaved.push(snapshot.clone());
        snapshot
    }

    pub fn get_snapshot_by_version(&self, version: u64) -> Result<&Snapshot> {
        self.history.get_snapshot_by_version(version)
    }

    /// Oldest base version an undelivered submission may still need
    fn replay_floor(&self) -> u64 {
        self.inbox
            .pending()
            .filter_map(|envelope| match &envelope.message {
                SyncMessage::Operation { operation, .. } | SyncMessage::Comment { operation, .. } => {
                    Some(operation.base_version)
                }
                _ => None,
            })
            .min()
            .unwrap_or(self.state.version)
            .min(self.state.version)
    }

    /// Bulk import of structured fields. A snapshot is taken first so the
    /// pre-import state stays restorable.
    pub fn import_fields(
        &mut self,
        author_id: UserId,
        fields: Map<String, Value>,
        data_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let paths = fields
            .into_iter()
            .map(|(key, value)| Ok((FieldPath::parse(&key)?, value)))
            .collect::<Result<Vec<_>>>()?;

        self.create_snapshot(Some(author_id), now);
        for (path, value) in paths {
            let mut op = Operation::update(
                self.document_id(),
                author_id,
                self.state.version,
                path,
                Some(value),
            )
            .with_timestamp(now);
            if let Some(data_type) = data_type {
                op = op.with_data_type(data_type);
            }
            self.commit(op, now, Audience::Everyone);
        }
        info!(document = %self.document_id(), version = self.state.version, "fields imported");
        Ok(self.state.version)
    }

    /// Housekeeping: presence sweep, cursor flush, gap expiry and the
    /// periodic snapshot
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let swept = self.presence.sweep(now);
        for update in &swept {
            if let PresenceUpdate::UserLeft { user_id } = update {
                self.peers.remove(user_id);
                self.rate_limiter.forget(user_id);
            }
        }
        self.publish_presence(swept);

        let cursors = self.presence.flush_cursors(now);
        self.publish_presence(cursors);

        for (user_id, expected_seq) in self.inbox.expire(now) {
            warn!(
                document = %self.document_id(),
                user = %user_id,
                expected_seq,
                "submission gap timed out"
            );
            self.send_to(user_id, SyncMessage::ResyncRequired { expected_seq });
        }

        let period_elapsed = Duration::from_std(self.config.snapshot_period())
            .map_or(false, |period| now - self.last_snapshot_at >= period);
        if self.ops_since_snapshot > 0 && period_elapsed {
            self.create_snapshot(None, now);
        }
    }

    /// Snapshot at or before `since` plus the committed tail after it
    pub fn resync_payload(&self, since: u64) -> SyncMessage {
        let snapshot = self
            .history
            .nearest_at_or_before(since)
            .or_else(|| self.history.latest())
            .filter(|s| s.version >= self.log.base_version())
            .cloned()
            .unwrap_or_else(|| Snapshot::capture(&self.state, None));
        let operations = self
            .log
            .since(snapshot.version)
            .map(<[Operation]>::to_vec)
            .unwrap_or_default();
        SyncMessage::Resync {
            snapshot,
            operations,
        }
    }

    /// Recover a replica whose operation could not be rebased
    pub fn resync_from_snapshot(&mut self, user_id: UserId) {
        warn!(document = %self.document_id(), user = %user_id, "resyncing replica from snapshot");
        let payload = self.resync_payload(0);
        self.send_to(user_id, payload);
        self.events
            .emit_warning(self.document_id(), format!("replica {user_id} resynchronized"));
    }

    /// Snapshots created since the last call, oldest first
    pub fn take_unsaved_snapshots(&mut self) -> Vec<Snapshot> {
        std::mem::take(&mut self.unsaved)
    }

    fn publish_presence(&mut self, updates: Vec<PresenceUpdate>) {
        let document_id = self.document_id();
        for update in updates {
            let subject = match &update {
                PresenceUpdate::UserJoined { user } => {
                    self.events.emit_user_joined(UserJoinedEvent {
                        document_id,
                        user: user.clone(),
                    });
                    user.id
                }
                PresenceUpdate::UserLeft { user_id } => {
                    self.events.emit_user_left(UserLeftEvent {
                        document_id,
                        user_id: *user_id,
                    });
                    *user_id
                }
                PresenceUpdate::CursorMoved { user_id, cursor } => {
                    self.events.emit_cursor_update(CursorUpdateEvent {
                        document_id,
                        user_id: *user_id,
                        cursor: *cursor,
                    });
                    *user_id
                }
                PresenceUpdate::UserIdle { user_id } | PresenceUpdate::UserActive { user_id } => {
                    *user_id
                }
            };
            self.broadcast(SERVER_ID, SyncMessage::Presence { update }, Some(subject));
        }
    }

    fn send_to(&self, user_id: UserId, message: SyncMessage) {
        let Some(peer) = self.peers.get(&user_id) else {
            return;
        };
        let envelope = Envelope::from_server(self.document_id(), message);
        if peer.send(envelope).is_err() {
            debug!(user = %user_id, "peer channel closed");
        }
    }

    fn broadcast(&self, sender_id: UserId, message: SyncMessage, exclude: Option<UserId>) {
        let envelope = Envelope::new(self.document_id(), sender_id, message);
        for (user_id, peer) in &self.peers {
            if exclude == Some(*user_id) {
                continue;
            }
            if peer.send(envelope.clone()).is_err() {
                debug!(user = %user_id, "peer channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Content, CursorPosition};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn session_with(text: &str, config: CollaborationConfig) -> DocumentSession {
        let state = DocumentState::with_content(DocumentId::new(), Content::with_text(text));
        DocumentSession::new(state, config, EventHub::new(), ValuationRouter::new())
    }

    fn connect(
        session: &mut DocumentSession,
        name: &str,
        now: DateTime<Utc>,
    ) -> (UserId, UnboundedReceiver<Envelope>) {
        let user = User::new(UserId::new(), name);
        let user_id = user.id;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.join(user, 1, tx, now).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap().message,
            SyncMessage::Joined { .. }
        ));
        (user_id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Envelope>) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope.message);
        }
        out
    }

    fn submission(session: &DocumentSession, op: Operation, seq: u64) -> Envelope {
        Envelope::new(
            session.document_id(),
            op.author_id,
            SyncMessage::Operation {
                operation: op.with_seq(seq),
                version: None,
            },
        )
        .with_seq(seq)
    }

    #[test]
    fn test_concurrent_inserts_converge_on_session() {
        let mut session = session_with("Hello World", CollaborationConfig::default());
        let now = Utc::now();
        let (alice, mut alice_rx) = connect(&mut session, "Alice", now);
        let (bob, mut bob_rx) = connect(&mut session, "Bob", now);
        drain(&mut alice_rx);
        let doc = session.document_id();

        let first = Operation::insert(doc, alice, 0, 5, " Beautiful");
        let second = Operation::insert(doc, bob, 0, 11, "!");
        session.receive(submission(&session, first, 1), now).unwrap();
        session.receive(submission(&session, second, 1), now).unwrap();

        assert_eq!(session.state().content.text, "Hello Beautiful World!");
        assert_eq!(session.version(), 2);

        let to_alice = drain(&mut alice_rx);
        assert_eq!(to_alice[0], SyncMessage::Ack { seq: 1, version: 1 });
        assert!(matches!(
            &to_alice[1],
            SyncMessage::Operation { operation, version: Some(2) }
                if operation.kind == OperationKind::insert(21, "!")
        ));

        let to_bob = drain(&mut bob_rx);
        assert!(matches!(to_bob[0], SyncMessage::Operation { version: Some(1), .. }));
        assert_eq!(to_bob[1], SyncMessage::Ack { seq: 1, version: 2 });
    }

    #[test]
    fn test_out_of_order_submissions_are_buffered() {
        let mut session = session_with("", CollaborationConfig::default());
        let now = Utc::now();
        let (alice, mut rx) = connect(&mut session, "Alice", now);
        let doc = session.document_id();

        let a = Operation::insert(doc, alice, 0, 0, "a");
        let b = Operation::insert(doc, alice, 1, 1, "b");
        session.receive(submission(&session, b, 2), now).unwrap();
        assert_eq!(session.version(), 0);

        session.receive(submission(&session, a.clone(), 1), now).unwrap();
        assert_eq!(session.state().content.text, "ab");

        // duplicates are dropped silently
        session.receive(submission(&session, a, 1), now).unwrap();
        assert_eq!(session.version(), 2);
        assert_eq!(
            drain(&mut rx),
            vec![
                SyncMessage::Ack { seq: 1, version: 1 },
                SyncMessage::Ack { seq: 2, version: 2 },
            ]
        );
    }

    #[test]
    fn test_gap_timeout_requires_resync() {
        let mut session = session_with("", CollaborationConfig::default());
        let now = Utc::now();
        let (alice, mut rx) = connect(&mut session, "Alice", now);
        let op = Operation::insert(session.document_id(), alice, 0, 0, "late");
        session.receive(submission(&session, op, 3), now).unwrap();

        session.tick(now + Duration::seconds(10));
        assert!(drain(&mut rx)
            .iter()
            .any(|m| *m == SyncMessage::ResyncRequired { expected_seq: 1 }));
        assert_eq!(session.version(), 0);
    }

    #[test]
    fn test_malformed_operation_is_rejected() {
        let mut session = session_with("abc", CollaborationConfig::default());
        let now = Utc::now();
        let (alice, mut rx) = connect(&mut session, "Alice", now);
        let doc = session.document_id();

        let empty = Operation::insert(doc, alice, 0, 0, "");
        session.receive(submission(&session, empty, 1), now).unwrap();
        let future = Operation::insert(doc, alice, 7, 0, "x");
        session.receive(submission(&session, future, 2), now).unwrap();

        let messages = drain(&mut rx);
        assert!(matches!(messages[0], SyncMessage::Reject { seq: 1, .. }));
        assert!(matches!(messages[1], SyncMessage::Reject { seq: 2, .. }));
        assert!(session.log().is_empty());
        assert_eq!(session.state().content.text, "abc");
    }

    #[test]
    fn test_unaddressable_positions_do_not_panic() {
        let mut session = session_with("abc", CollaborationConfig::default());
        let now = Utc::now();
        let doc = session.document_id();
        let user = UserId::new();

        assert!(matches!(
            session.submit(Operation::delete(doc, user, 0, 1, usize::MAX), now),
            Err(CollaborationError::Malformed(_))
        ));

        session
            .submit(Operation::insert(doc, user, 0, 0, ">"), now)
            .unwrap();
        let far = Operation::insert(doc, UserId::new(), 0, usize::MAX, "!");
        assert_eq!(session.submit(far, now).unwrap(), 2);
        assert_eq!(session.state().content.text, ">abc!");
    }

    #[test]
    fn test_unjoined_sender_gets_error() {
        let mut session = session_with("", CollaborationConfig::default());
        let stranger = UserId::new();
        let op = Operation::insert(session.document_id(), stranger, 0, 0, "x");
        let result = session.receive(submission(&session, op, 1), Utc::now());
        assert!(matches!(result, Err(CollaborationError::NotJoined(_))));
    }

    #[test]
    fn test_room_size_cap() {
        let config = CollaborationConfig {
            max_room_size: 1,
            ..CollaborationConfig::default()
        };
        let mut session = session_with("", config);
        let now = Utc::now();
        let (alice, _rx) = connect(&mut session, "Alice", now);

        let (tx, _rx2) = mpsc::unbounded_channel();
        let bob = User::new(UserId::new(), "Bob");
        assert!(matches!(
            session.join(bob, 1, tx.clone(), now),
            Err(CollaborationError::RoomFull(1))
        ));

        // a present user may reconnect
        let again = User::new(alice, "Alice");
        assert!(session.join(again, 1, tx, now).is_ok());
        assert_eq!(session.info().user_count, 1);
    }

    #[test]
    fn test_rate_limiter_window() {
        let mut limiter = RateLimiter::new(2);
        let user = UserId::new();
        let now = Utc::now();
        assert!(limiter.check(user, now));
        assert!(limiter.check(user, now));
        assert!(!limiter.check(user, now + Duration::seconds(30)));
        assert!(limiter.check(user, now + Duration::seconds(61)));
        assert!(RateLimiter::new(0).check(user, now));
    }

    #[test]
    fn test_undo_and_redo_are_broadcast_to_everyone() {
        let mut session = session_with("Hello", CollaborationConfig::default());
        let now = Utc::now();
        let (alice, mut alice_rx) = connect(&mut session, "Alice", now);
        let (_bob, mut bob_rx) = connect(&mut session, "Bob", now);
        drain(&mut alice_rx);
        let doc = session.document_id();

        let op = Operation::insert(doc, alice, 0, 5, " World").with_timestamp(now);
        session.submit(op, now).unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let later = now + Duration::seconds(1);
        let undo = Envelope::new(doc, alice, SyncMessage::Undo).with_seq(1);
        session.receive(undo, later).unwrap();
        assert_eq!(session.state().content.text, "Hello");

        let to_alice = drain(&mut alice_rx);
        assert!(matches!(to_alice[0], SyncMessage::Operation { version: Some(2), .. }));
        assert_eq!(to_alice[1], SyncMessage::Ack { seq: 1, version: 2 });
        assert_eq!(drain(&mut bob_rx).len(), 1);

        let redo = Envelope::new(doc, alice, SyncMessage::Redo).with_seq(2);
        session.receive(redo, later + Duration::seconds(1)).unwrap();
        assert_eq!(session.state().content.text, "Hello World");

        let nothing = Envelope::new(doc, alice, SyncMessage::Redo).with_seq(3);
        session.receive(nothing, later).unwrap();
        assert!(matches!(
            drain(&mut alice_rx).last(),
            Some(SyncMessage::Reject { seq: 3, .. })
        ));
    }

    #[test]
    fn test_snapshot_every_n_operations() {
        let config = CollaborationConfig {
            snapshot_interval_ops: 2,
            ..CollaborationConfig::default()
        };
        let mut session = session_with("", config);
        let now = Utc::now();
        let user = UserId::new();
        let doc = session.document_id();

        for i in 0..5 {
            let op = Operation::insert(doc, user, i, 0, "x");
            session.submit(op, now).unwrap();
        }
        assert_eq!(session.history().versions(), vec![0, 2, 4]);
        let unsaved: Vec<u64> = session
            .take_unsaved_snapshots()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(unsaved, vec![2, 4]);
        assert!(session.take_unsaved_snapshots().is_empty());
        assert_eq!(session.get_snapshot_by_version(4).unwrap().content.text, "xxxx");
    }

    #[test]
    fn test_periodic_snapshot_on_tick() {
        let mut session = session_with("", CollaborationConfig::default());
        let start = Utc::now();
        let op = Operation::insert(session.document_id(), UserId::new(), 0, 0, "x");
        session.submit(op, start).unwrap();

        session.tick(start + Duration::seconds(5));
        assert!(session.take_unsaved_snapshots().is_empty());

        session.tick(start + Duration::seconds(120));
        assert_eq!(session.take_unsaved_snapshots().len(), 1);

        // nothing changed since
        session.tick(start + Duration::seconds(400));
        assert!(session.take_unsaved_snapshots().is_empty());
    }

    #[test]
    fn test_import_takes_snapshot_first() {
        let mut session = session_with("", CollaborationConfig::default());
        let author = UserId::new();
        let now = Utc::now();
        let mut fields = Map::new();
        fields.insert("revenue".to_string(), json!(1_000_000));
        fields.insert("dcf.wacc".to_string(), json!(0.08));

        let version = session.import_fields(author, fields, Some("dcf"), now).unwrap();
        assert_eq!(version, 2);
        assert_eq!(session.state().content.fields["dcf"]["wacc"], json!(0.08));

        let before = session.get_snapshot_by_version(0).unwrap();
        assert_eq!(before.author_id, Some(author));
        assert!(before.content.fields.is_empty());
    }

    #[test]
    fn test_resync_payload_replays_to_head() {
        let config = CollaborationConfig {
            snapshot_interval_ops: 3,
            ..CollaborationConfig::default()
        };
        let mut session = session_with("", config);
        let user = UserId::new();
        let doc = session.document_id();
        let now = Utc::now();
        for i in 0..5 {
            session
                .submit(Operation::insert(doc, user, i, i as usize, "ab"), now)
                .unwrap();
        }

        let SyncMessage::Resync { snapshot, operations } = session.resync_payload(4) else {
            panic!("expected resync payload");
        };
        assert_eq!(snapshot.version, 3);
        let mut state = snapshot.restore();
        for op in &operations {
            apply_in_place(&mut state, op);
        }
        assert_eq!(state, *session.state());
    }

    #[test]
    fn test_cursor_moves_reach_other_users() {
        let mut session = session_with("hello", CollaborationConfig::default());
        let now = Utc::now();
        let (alice, mut alice_rx) = connect(&mut session, "Alice", now);
        let (_bob, mut bob_rx) = connect(&mut session, "Bob", now);
        drain(&mut alice_rx);

        let cursor = Envelope::new(
            session.document_id(),
            alice,
            SyncMessage::Cursor {
                cursor: CursorPosition::at(3),
            },
        );
        session.receive(cursor, now).unwrap();

        assert!(drain(&mut alice_rx).is_empty());
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [SyncMessage::Presence {
                update: PresenceUpdate::CursorMoved { .. }
            }]
        ));
    }

    #[test]
    fn test_leave_is_reported_once() {
        let mut session = session_with("", CollaborationConfig::default());
        let now = Utc::now();
        let (alice, _alice_rx) = connect(&mut session, "Alice", now);
        let (_bob, mut bob_rx) = connect(&mut session, "Bob", now);

        session.leave(alice);
        session.leave(alice);
        session.tick(now + Duration::seconds(600));

        let left = drain(&mut bob_rx)
            .into_iter()
            .filter(|m| {
                matches!(
                    m,
                    SyncMessage::Presence {
                        update: PresenceUpdate::UserLeft { user_id }
                    } if *user_id == alice
                )
            })
            .count();
        assert_eq!(left, 1);
    }
}
