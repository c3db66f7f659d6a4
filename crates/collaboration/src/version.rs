/// Versioned snapshots of document content
/// Bounded in-memory history plus a pluggable persistence collaborator
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::{CollaborationError, Content, DocumentId, DocumentState, Result, UserId};

/// Materialized content of a document at a committed version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document_id: DocumentId,
    pub version: u64,
    pub content: Content,

    /// User who asked for the snapshot; `None` for automatic snapshots
    #[serde(default)]
    pub author_id: Option<UserId>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Snapshot {
    pub fn capture(state: &DocumentState, author_id: Option<UserId>) -> Self {
        Self {
            document_id: state.document_id,
            version: state.version,
            content: state.content.clone(),
            author_id,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Rebuild the document state this snapshot was taken from
    pub fn restore(&self) -> DocumentState {
        DocumentState {
            document_id: self.document_id,
            version: self.version,
            content: self.content.clone(),
        }
    }
}

/// Capacity-bounded, version-ordered snapshot history of one document
#[derive(Debug, Clone)]
pub struct VersionHistory {
    capacity: usize,
    snapshots: VecDeque<Snapshot>,
}

impl VersionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            snapshots: VecDeque::new(),
        }
    }

    /// Record a snapshot of `state`.
    ///
    /// The snapshot carries `state.version` as is; taking one never advances
    /// the document version, so a snapshot always equals a prefix of the log.
    /// Snapshotting an unchanged version replaces the older entry. When over
    /// capacity the oldest entries are evicted, but never the newest one and
    /// never the last snapshot at or before `floor`, the oldest version some
    /// outstanding operation may still need to be replayed from.
    pub fn create_snapshot(
        &mut self,
        state: &DocumentState,
        author_id: Option<UserId>,
        floor: u64,
    ) -> &Snapshot {
        let snapshot = Snapshot::capture(state, author_id);
        self.insert(snapshot, floor)
    }

    /// Adopt a snapshot produced elsewhere (store seed, resync)
    pub fn insert(&mut self, snapshot: Snapshot, floor: u64) -> &Snapshot {
        match self.snapshots.back() {
            Some(last) if last.version == snapshot.version => {
                self.snapshots.pop_back();
            }
            Some(last) if last.version > snapshot.version => {
                // History restarts when an older state is adopted
                self.snapshots.clear();
            }
            _ => {}
        }
        self.snapshots.push_back(snapshot);

        while self.snapshots.len() > self.capacity {
            let front_is_replay_base = match (self.snapshots.front(), self.snapshots.get(1)) {
                (Some(front), Some(next)) => front.version <= floor && next.version > floor,
                _ => true,
            };
            if front_is_replay_base {
                break;
            }
            if let Some(evicted) = self.snapshots.pop_front() {
                tracing::debug!(version = evicted.version, "evicted snapshot from history");
            }
        }

        &self.snapshots[self.snapshots.len() - 1]
    }

    pub fn get_snapshot_by_version(&self, version: u64) -> Result<&Snapshot> {
        self.snapshots
            .iter()
            .find(|s| s.version == version)
            .ok_or_else(|| CollaborationError::NotFound(format!("snapshot at version {version}")))
    }

    /// Newest snapshot whose version is not after `version`
    pub fn nearest_at_or_before(&self, version: u64) -> Option<&Snapshot> {
        self.snapshots.iter().rev().find(|s| s.version <= version)
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    pub fn oldest(&self) -> Option<&Snapshot> {
        self.snapshots.front()
    }

    pub fn versions(&self) -> Vec<u64> {
        self.snapshots.iter().map(|s| s.version).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Persistence collaborator for snapshots.
///
/// Implementations must be safe to call from many session actors at once.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self, document_id: DocumentId, version: u64)
        -> Result<Option<Snapshot>>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn load_latest(&self, document_id: DocumentId) -> Result<Option<Snapshot>>;
}

/// Process-local store, mainly for tests and single-node deployments
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<DocumentId, BTreeMap<u64, Snapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self, document_id: DocumentId) -> Vec<u64> {
        self.snapshots
            .lock()
            .get(&document_id)
            .map(|by_version| by_version.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_snapshot(
        &self,
        document_id: DocumentId,
        version: u64,
    ) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshots
            .lock()
            .get(&document_id)
            .and_then(|by_version| by_version.get(&version))
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots
            .lock()
            .entry(snapshot.document_id)
            .or_default()
            .insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    async fn load_latest(&self, document_id: DocumentId) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshots
            .lock()
            .get(&document_id)
            .and_then(|by_version| by_version.values().next_back())
            .cloned())
    }
}

/// Stores snapshots as JSON files under `<root>/<document_id>/<version>.json`
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn document_dir(&self, document_id: DocumentId) -> PathBuf {
        self.root.join(document_id.to_string())
    }

    fn snapshot_path(&self, document_id: DocumentId, version: u64) -> PathBuf {
        self.document_dir(document_id).join(format!("{version}.json"))
    }

    async fn read_snapshot(path: &Path) -> Result<Snapshot> {
        let json = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load_snapshot(
        &self,
        document_id: DocumentId,
        version: u64,
    ) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path(document_id, version);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_snapshot(&path).await.map(Some)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.document_dir(snapshot.document_id);
        fs::create_dir_all(&dir).await?;

        let json = serde_json::to_string_pretty(snapshot)?;
        let path = self.snapshot_path(snapshot.document_id, snapshot.version);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn load_latest(&self, document_id: DocumentId) -> Result<Option<Snapshot>> {
        let dir = self.document_dir(document_id);
        if !fs::try_exists(&dir).await? {
            return Ok(None);
        }

        let mut latest: Option<u64> = None;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let version = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok());
            if let Some(version) = version {
                latest = Some(latest.map_or(version, |best| best.max(version)));
            }
        }

        match latest {
            Some(version) => self.load_snapshot(document_id, version).await,
            None => Ok(None),
        }
    }
}

/// Exponential backoff for retrying snapshot saves
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; doubles on every call up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(document_id: DocumentId, version: u64, text: &str) -> DocumentState {
        DocumentState {
            document_id,
            version,
            content: Content::with_text(text),
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let state = state_at(DocumentId::new(), 7, "Hello");
        let snapshot = Snapshot::capture(&state, Some(UserId::new()));
        assert_eq!(snapshot.restore(), state);

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.restore(), state);
    }

    #[test]
    fn test_resnapshot_same_version_replaces() {
        let doc = DocumentId::new();
        let mut history = VersionHistory::new(5);
        history.create_snapshot(&state_at(doc, 3, "a"), None, 3);
        let author = UserId::new();
        history.create_snapshot(&state_at(doc, 3, "a"), Some(author), 3);

        assert_eq!(history.len(), 1);
        assert_eq!(history.latest().unwrap().version, 3);
        assert_eq!(history.latest().unwrap().author_id, Some(author));
    }

    #[test]
    fn test_eviction_keeps_newest_and_floor() {
        let doc = DocumentId::new();
        let mut history = VersionHistory::new(2);
        for version in [10, 20, 30] {
            history.create_snapshot(&state_at(doc, version, "x"), None, 15);
        }
        // An operation based on version 15 replays from snapshot 10
        assert_eq!(history.versions(), vec![10, 20, 30]);

        history.create_snapshot(&state_at(doc, 40, "x"), None, 25);
        assert_eq!(history.versions(), vec![20, 30, 40]);

        history.create_snapshot(&state_at(doc, 50, "x"), None, 50);
        assert_eq!(history.versions(), vec![40, 50]);
        assert!(history.get_snapshot_by_version(20).is_err());
        assert_eq!(history.nearest_at_or_before(47).unwrap().version, 40);
    }

    #[test]
    fn test_capacity_one_keeps_newest() {
        let doc = DocumentId::new();
        let mut history = VersionHistory::new(1);
        history.create_snapshot(&state_at(doc, 1, "a"), None, 10);
        history.create_snapshot(&state_at(doc, 2, "b"), None, 10);
        assert_eq!(history.versions(), vec![2]);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_memory_store_latest() {
        let store = MemorySnapshotStore::new();
        let doc = DocumentId::new();
        for version in [4, 9, 2] {
            store
                .save_snapshot(&Snapshot::capture(&state_at(doc, version, "x"), None))
                .await
                .unwrap();
        }
        assert_eq!(store.load_latest(doc).await.unwrap().unwrap().version, 9);
        assert!(store.load_snapshot(doc, 5).await.unwrap().is_none());
        assert!(store.load_latest(DocumentId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let doc = DocumentId::new();

        assert!(store.load_latest(doc).await.unwrap().is_none());

        let early = Snapshot::capture(&state_at(doc, 3, "early"), None);
        let late = Snapshot::capture(&state_at(doc, 12, "late"), Some(UserId::new()));
        store.save_snapshot(&late).await.unwrap();
        store.save_snapshot(&early).await.unwrap();

        assert_eq!(store.load_latest(doc).await.unwrap(), Some(late));
        assert_eq!(store.load_snapshot(doc, 3).await.unwrap(), Some(early));
        assert!(store.load_snapshot(doc, 4).await.unwrap().is_none());
    }
}
