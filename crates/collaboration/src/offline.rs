/// Offline support for collaborative editing
/// Persist a replica's unacknowledged submissions and restore them on reconnect
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::{DocumentId, PendingSubmission, Replica, Result, Snapshot, User, UserId};

/// Saved state of a replica that went offline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueue {
    pub document_id: DocumentId,

    pub user: User,

    /// Last state acknowledged by the session
    pub confirmed: Snapshot,

    /// Sequence number the next new submission will use
    pub next_seq: u64,

    /// Submissions not yet acknowledged, oldest first
    pub pending: Vec<PendingSubmission>,

    /// Queue creation timestamp
    pub created_at: DateTime<Utc>,
}

impl OfflineQueue {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Replica that resumes where this queue left off; call `connect` to rejoin
    pub fn into_replica(self) -> Replica {
        Replica::from_parts(self.confirmed.restore(), self.user, self.next_seq, self.pending)
    }
}

impl Replica {
    pub fn to_offline_queue(&self) -> OfflineQueue {
        OfflineQueue {
            document_id: self.document_id(),
            user: self.user().clone(),
            confirmed: Snapshot::capture(self.confirmed(), Some(self.user_id())),
            next_seq: self.next_seq(),
            pending: self.pending(),
            created_at: Utc::now(),
        }
    }
}

/// Offline queue storage, one JSON file per document and user
pub struct OfflineQueueManager {
    storage_dir: PathBuf,
}

impl OfflineQueueManager {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
        }
    }

    fn queue_path(&self, document_id: DocumentId, user_id: UserId) -> PathBuf {
        self.storage_dir
            .join(format!("offline_queue_{document_id}_{user_id}.json"))
    }

    /// Save the queue to disk. An empty queue removes any saved file instead.
    pub async fn save_queue(&self, queue: &OfflineQueue) -> Result<()> {
        if queue.is_empty() {
            return self.delete_saved_queue(queue.document_id, queue.user.id).await;
        }

        fs::create_dir_all(&self.storage_dir).await?;

        let json = serde_json::to_string_pretty(queue)?;
        let path = self.queue_path(queue.document_id, queue.user.id);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json).await?;
        fs::rename(&staging, &path).await?;

        info!(
            document = %queue.document_id,
            pending = queue.len(),
            "saved offline queue"
        );
        Ok(())
    }

    pub async fn load_queue(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Option<OfflineQueue>> {
        let path = self.queue_path(document_id, user_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let json = fs::read_to_string(&path).await?;
        let queue: OfflineQueue = serde_json::from_str(&json)?;
        debug!(document = %document_id, pending = queue.len(), "loaded offline queue");
        Ok(Some(queue))
    }

    pub async fn delete_saved_queue(&self, document_id: DocumentId, user_id: UserId) -> Result<()> {
        let path = self.queue_path(document_id, user_id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Restore the replica for `user`, or start a fresh one
    pub async fn restore_replica(&self, document_id: DocumentId, user: User) -> Result<Replica> {
        match self.load_queue(document_id, user.id).await? {
            Some(queue) => Ok(queue.into_replica()),
            None => Ok(Replica::new(document_id, user)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentState, Envelope, SyncMessage};

    fn offline_replica() -> Replica {
        let doc = DocumentId::new();
        let mut replica = Replica::new(doc, User::new(UserId::new(), "Grace"));
        replica.connect();
        replica.receive(Envelope::from_server(
            doc,
            SyncMessage::Joined {
                snapshot: Snapshot::capture(&DocumentState::new(doc), None),
                delivered_seq: 0,
                users: Vec::new(),
            },
        ));
        replica
    }

    #[test]
    fn test_offline_queue() {
        let mut replica = offline_replica();
        assert!(replica.to_offline_queue().is_empty());

        replica.insert(0, "draft").unwrap();
        replica.insert(5, "!").unwrap();
        let queue = replica.to_offline_queue();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next_seq, 3);

        let restored = queue.into_replica();
        assert_eq!(restored.text(), "draft!");
        assert_eq!(restored.pending_len(), 2);
        assert_eq!(restored.next_seq(), 3);
    }

    #[tokio::test]
    async fn test_queue_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = OfflineQueueManager::new(dir.path());
        let mut replica = offline_replica();
        let doc = replica.document_id();
        let user = replica.user().clone();

        assert!(manager.load_queue(doc, user.id).await.unwrap().is_none());

        replica.insert(0, "kept").unwrap();
        manager.save_queue(&replica.to_offline_queue()).await.unwrap();

        let mut restored = manager.restore_replica(doc, user.clone()).await.unwrap();
        assert_eq!(restored.text(), "kept");

        // Rejoining resumes at the first unacknowledged submission
        restored.connect();
        let outgoing = restored.take_outgoing();
        assert!(matches!(outgoing[0].message, SyncMessage::Join { next_seq: 1, .. }));

        manager.delete_saved_queue(doc, user.id).await.unwrap();
        let fresh = manager.restore_replica(doc, user).await.unwrap();
        assert_eq!(fresh.pending_len(), 0);
    }
}
