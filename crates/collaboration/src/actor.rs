/// One task per document: serialized command processing, housekeeping ticks
/// and background snapshot persistence
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    Backoff, CollaborationConfig, CollaborationError, DocumentId, DocumentSession, DocumentState,
    Envelope, EventHub, Operation, PeerSender, Result, SessionInfo, Snapshot, SnapshotStore, User,
    UserId,
};

const COMMAND_CAPACITY: usize = 1024;

/// Requests served by a session actor
pub enum SessionCommand {
    Join {
        user: User,
        next_seq: u64,
        peer: PeerSender,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Client message; failures are reported to the sender by the session
    Receive { envelope: Envelope },
    Detach { user_id: UserId },
    Submit {
        operation: Operation,
        reply: oneshot::Sender<Result<u64>>,
    },
    Undo {
        user_id: UserId,
        reply: oneshot::Sender<Result<u64>>,
    },
    Redo {
        user_id: UserId,
        reply: oneshot::Sender<Result<u64>>,
    },
    CreateSnapshot {
        author_id: Option<UserId>,
        reply: oneshot::Sender<Snapshot>,
    },
    GetSnapshot {
        version: u64,
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    Import {
        author_id: UserId,
        fields: Map<String, Value>,
        data_type: Option<String>,
        reply: oneshot::Sender<Result<u64>>,
    },
    State {
        reply: oneshot::Sender<DocumentState>,
    },
    Info {
        reply: oneshot::Sender<SessionInfo>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable address of a running session actor
#[derive(Clone)]
pub struct SessionHandle {
    document_id: DocumentId,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// The actor has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CollaborationError::SessionClosed(self.document_id))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await
            .map_err(|_| CollaborationError::SessionClosed(self.document_id))
    }

    pub async fn join(&self, user: User, next_seq: u64, peer: PeerSender) -> Result<()> {
        self.request(|reply| SessionCommand::Join {
            user,
            next_seq,
            peer,
            reply,
        })
        .await?
    }

    pub async fn receive(&self, envelope: Envelope) -> Result<()> {
        self.send(SessionCommand::Receive { envelope }).await
    }

    pub async fn detach(&self, user_id: UserId) -> Result<()> {
        self.send(SessionCommand::Detach { user_id }).await
    }

    pub async fn submit(&self, operation: Operation) -> Result<u64> {
        self.request(|reply| SessionCommand::Submit { operation, reply })
            .await?
    }

    pub async fn undo(&self, user_id: UserId) -> Result<u64> {
        self.request(|reply| SessionCommand::Undo { user_id, reply })
            .await?
    }

    pub async fn redo(&self, user_id: UserId) -> Result<u64> {
        self.request(|reply| SessionCommand::Redo { user_id, reply })
            .await?
    }

    /// Explicit save
    pub async fn create_snapshot(&self, author_id: Option<UserId>) -> Result<Snapshot> {
        self.request(|reply| SessionCommand::CreateSnapshot { author_id, reply })
            .await
    }

    pub async fn get_snapshot(&self, version: u64) -> Result<Snapshot> {
        self.request(|reply| SessionCommand::GetSnapshot { version, reply })
            .await?
    }

    pub async fn import_fields(
        &self,
        author_id: UserId,
        fields: Map<String, Value>,
        data_type: Option<String>,
    ) -> Result<u64> {
        self.request(|reply| SessionCommand::Import {
            author_id,
            fields,
            data_type,
            reply,
        })
        .await?
    }

    pub async fn state(&self) -> Result<DocumentState> {
        self.request(|reply| SessionCommand::State { reply }).await
    }

    pub async fn info(&self) -> Result<SessionInfo> {
        self.request(|reply| SessionCommand::Info { reply }).await
    }

    /// Take a final snapshot, flush pending saves and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Shutdown { reply }).await
    }
}

/// Start the actor owning `session`
pub fn spawn_session(
    session: DocumentSession,
    store: Arc<dyn SnapshotStore>,
    events: EventHub,
    config: &CollaborationConfig,
) -> SessionHandle {
    let document_id = session.document_id();
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let (saved_tx, saved_rx) = mpsc::unbounded_channel();

    let actor = SessionActor {
        session,
        store,
        events,
        commands: rx,
        saved_tx,
        saved_rx,
        save_queue: VecDeque::new(),
        queue_limit: config.history_capacity.max(1),
        saving: false,
        retry_at: None,
        backoff: Backoff::new(config.snapshot_retry_base(), config.snapshot_retry_max()),
        empty_since: None,
        empty_timeout: config.empty_session_timeout(),
        tick_interval: config.tick_interval(),
    };
    tokio::spawn(actor.run());

    SessionHandle { document_id, tx }
}

type SaveOutcome = (Snapshot, Result<()>);

struct SessionActor {
    session: DocumentSession,
    store: Arc<dyn SnapshotStore>,
    events: EventHub,
    commands: mpsc::Receiver<SessionCommand>,
    saved_tx: mpsc::UnboundedSender<SaveOutcome>,
    saved_rx: mpsc::UnboundedReceiver<SaveOutcome>,

    /// Snapshots waiting to be persisted, oldest first
    save_queue: VecDeque<Snapshot>,
    queue_limit: usize,
    saving: bool,
    retry_at: Option<Instant>,
    backoff: Backoff,

    empty_since: Option<Instant>,
    empty_timeout: std::time::Duration,
    tick_interval: std::time::Duration,
}

impl SessionActor {
    async fn run(mut self) {
        let document_id = self.session.document_id();
        info!(document = %document_id, version = self.session.version(), "session started");

        let period = self.tick_interval.max(std::time::Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown { reply }) => {
                        self.finish().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.finish().await;
                        break;
                    }
                },
                Some((snapshot, result)) = self.saved_rx.recv() => {
                    self.on_saved(snapshot, result);
                }
                _ = time::sleep_until(self.retry_at.unwrap_or_else(Instant::now)),
                    if self.retry_at.is_some() && !self.saving => {}
                _ = ticker.tick() => {
                    if self.on_tick() {
                        info!(document = %document_id, "session idle, shutting down");
                        self.finish().await;
                        break;
                    }
                }
            }
            self.collect_snapshots();
            self.pump_saves();
        }

        info!(document = %document_id, "session stopped");
    }

    fn handle(&mut self, command: SessionCommand) {
        let now = Utc::now();
        match command {
            SessionCommand::Join {
                user,
                next_seq,
                peer,
                reply,
            } => {
                let _ = reply.send(self.session.join(user, next_seq, peer, now));
            }
            SessionCommand::Receive { envelope } => {
                if let Err(err) = self.session.receive(envelope, now) {
                    debug!(error = %err, "client message refused");
                }
            }
            SessionCommand::Detach { user_id } => self.session.detach(user_id),
            SessionCommand::Submit { operation, reply } => {
                let _ = reply.send(self.session.submit(operation, now));
            }
            SessionCommand::Undo { user_id, reply } => {
                let _ = reply.send(self.session.undo(user_id, now));
            }
            SessionCommand::Redo { user_id, reply } => {
                let _ = reply.send(self.session.redo(user_id, now));
            }
            SessionCommand::CreateSnapshot { author_id, reply } => {
                let _ = reply.send(self.session.create_snapshot(author_id, now));
            }
            SessionCommand::GetSnapshot { version, reply } => {
                let _ = reply.send(self.session.get_snapshot_by_version(version).cloned());
            }
            SessionCommand::Import {
                author_id,
                fields,
                data_type,
                reply,
            } => {
                let result =
                    self.session
                        .import_fields(author_id, fields, data_type.as_deref(), now);
                let _ = reply.send(result);
            }
            SessionCommand::State { reply } => {
                let _ = reply.send(self.session.state().clone());
            }
            SessionCommand::Info { reply } => {
                let _ = reply.send(self.session.info());
            }
            SessionCommand::Shutdown { .. } => {}
        }
    }

    /// Returns true once the session has been empty long enough to stop
    fn on_tick(&mut self) -> bool {
        self.session.tick(Utc::now());

        if !self.session.is_empty() {
            self.empty_since = None;
            return false;
        }
        let since = *self.empty_since.get_or_insert_with(Instant::now);
        since.elapsed() >= self.empty_timeout
    }

    fn collect_snapshots(&mut self) {
        for snapshot in self.session.take_unsaved_snapshots() {
            self.save_queue.push_back(snapshot);
        }
        while self.save_queue.len() > self.queue_limit {
            if let Some(dropped) = self.save_queue.pop_front() {
                warn!(version = dropped.version, "dropping unsaved snapshot, store is behind");
            }
        }
    }

    /// Start the next save unless one is running or a retry is pending
    fn pump_saves(&mut self) {
        if self.saving {
            return;
        }
        if self.retry_at.map_or(false, |at| Instant::now() < at) {
            return;
        }
        let Some(snapshot) = self.save_queue.pop_front() else {
            return;
        };

        self.saving = true;
        self.retry_at = None;
        let store = self.store.clone();
        let saved_tx = self.saved_tx.clone();
        tokio::spawn(async move {
            let result = store.save_snapshot(&snapshot).await;
            let _ = saved_tx.send((snapshot, result));
        });
    }

    fn on_saved(&mut self, snapshot: Snapshot, result: Result<()>) {
        self.saving = false;
        match result {
            Ok(()) => {
                debug!(version = snapshot.version, "snapshot saved");
                self.backoff.reset();
            }
            Err(err) => {
                let delay = self.backoff.next_delay();
                self.events.emit_warning(
                    snapshot.document_id,
                    format!(
                        "saving snapshot {} failed ({err}), retry {} in {delay:?}",
                        snapshot.version,
                        self.backoff.attempts()
                    ),
                );
                self.retry_at = Some(Instant::now() + delay);
                self.save_queue.push_front(snapshot);
            }
        }
    }

    /// Final snapshot and one last attempt at every queued save
    async fn finish(&mut self) {
        self.commands.close();
        if self.session.ops_since_snapshot() > 0 {
            self.session.create_snapshot(None, Utc::now());
        }
        self.collect_snapshots();

        // a save started by the loop still reports back
        if self.saving {
            if let Some((snapshot, result)) = self.saved_rx.recv().await {
                if result.is_err() {
                    self.save_queue.push_front(snapshot);
                }
            }
            self.saving = false;
        }

        while let Some(snapshot) = self.save_queue.pop_front() {
            if let Err(err) = self.store.save_snapshot(&snapshot).await {
                self.events.emit_warning(
                    snapshot.document_id,
                    format!("snapshot {} lost on shutdown: {err}", snapshot.version),
                );
            }
        }
    }
}
