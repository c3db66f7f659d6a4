/// Typed event streams for UI collaborators
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{CommentAction, CursorPosition, DocumentId, Operation, User, UserId};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJoinedEvent {
    pub document_id: DocumentId,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeftEvent {
    pub document_id: DocumentId,
    pub user_id: UserId,
}

/// A committed change to the text region or structured fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdateEvent {
    pub document_id: DocumentId,
    pub version: u64,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdateEvent {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub cursor: CursorPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentUpdateEvent {
    pub document_id: DocumentId,
    pub version: u64,
    pub action: CommentAction,
}

/// Recoverable fault surfaced to the UI (store unavailable, resync, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningEvent {
    pub document_id: DocumentId,
    pub message: String,
}

/// Receiving half of one event stream.
///
/// Slow subscribers skip what they missed rather than blocking sessions.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Next event, or `None` once every session has shut down
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Fan-out point for every session's events
#[derive(Clone)]
pub struct EventHub {
    user_joined: broadcast::Sender<UserJoinedEvent>,
    user_left: broadcast::Sender<UserLeftEvent>,
    data_update: broadcast::Sender<DataUpdateEvent>,
    cursor_update: broadcast::Sender<CursorUpdateEvent>,
    comment_update: broadcast::Sender<CommentUpdateEvent>,
    warning: broadcast::Sender<WarningEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            user_joined: broadcast::channel(CHANNEL_CAPACITY).0,
            user_left: broadcast::channel(CHANNEL_CAPACITY).0,
            data_update: broadcast::channel(CHANNEL_CAPACITY).0,
            cursor_update: broadcast::channel(CHANNEL_CAPACITY).0,
            comment_update: broadcast::channel(CHANNEL_CAPACITY).0,
            warning: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn user_joined(&self) -> Subscription<UserJoinedEvent> {
        Subscription {
            rx: self.user_joined.subscribe(),
        }
    }

    pub fn user_left(&self) -> Subscription<UserLeftEvent> {
        Subscription {
            rx: self.user_left.subscribe(),
        }
    }

    pub fn data_update(&self) -> Subscription<DataUpdateEvent> {
        Subscription {
            rx: self.data_update.subscribe(),
        }
    }

    pub fn cursor_update(&self) -> Subscription<CursorUpdateEvent> {
        Subscription {
            rx: self.cursor_update.subscribe(),
        }
    }

    pub fn comment_update(&self) -> Subscription<CommentUpdateEvent> {
        Subscription {
            rx: self.comment_update.subscribe(),
        }
    }

    pub fn warning(&self) -> Subscription<WarningEvent> {
        Subscription {
            rx: self.warning.subscribe(),
        }
    }

    // Sending only fails when nobody is subscribed.

    pub(crate) fn emit_user_joined(&self, event: UserJoinedEvent) {
        let _ = self.user_joined.send(event);
    }

    pub(crate) fn emit_user_left(&self, event: UserLeftEvent) {
        let _ = self.user_left.send(event);
    }

    pub(crate) fn emit_data_update(&self, event: DataUpdateEvent) {
        let _ = self.data_update.send(event);
    }

    pub(crate) fn emit_cursor_update(&self, event: CursorUpdateEvent) {
        let _ = self.cursor_update.send(event);
    }

    pub(crate) fn emit_comment_update(&self, event: CommentUpdateEvent) {
        let _ = self.comment_update.send(event);
    }

    pub(crate) fn emit_warning(&self, document_id: DocumentId, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(document = %document_id, %message, "collaboration warning");
        let _ = self.warning.send(WarningEvent {
            document_id,
            message,
        });
    }
}
