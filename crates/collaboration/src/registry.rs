/// Server-side registry of live document sessions
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    spawn_session, CollaborationConfig, DocumentId, DocumentSession, DocumentState, EventHub,
    Result, SessionHandle, SessionInfo, SnapshotStore, ValuationRouter,
};

/// Creates session actors on demand and hands out their handles
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<DocumentId, SessionHandle>>>,
    store: Arc<dyn SnapshotStore>,
    events: EventHub,
    valuation: ValuationRouter,
    config: CollaborationConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: CollaborationConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            events: EventHub::new(),
            valuation: ValuationRouter::new(),
            config,
        }
    }

    pub fn with_valuation(mut self, valuation: ValuationRouter) -> Self {
        self.valuation = valuation;
        self
    }

    /// Event streams of every session created by this registry
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn config(&self) -> &CollaborationConfig {
        &self.config
    }

    /// Handle of the live session for `document_id`, starting one from the
    /// latest stored snapshot if needed
    pub async fn get_or_create(&self, document_id: DocumentId) -> Result<SessionHandle> {
        if let Some(handle) = self.get(document_id).await {
            return Ok(handle);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&document_id).filter(|h| !h.is_closed()) {
            return Ok(handle.clone());
        }

        let state = match self.store.load_latest(document_id).await {
            Ok(Some(snapshot)) => snapshot.restore(),
            Ok(None) => DocumentState::new(document_id),
            Err(err) => {
                self.events.emit_warning(
                    document_id,
                    format!("cannot load document from store: {err}"),
                );
                return Err(err);
            }
        };

        info!(document = %document_id, version = state.version, "creating session");
        let session = DocumentSession::new(
            state,
            self.config.clone(),
            self.events.clone(),
            self.valuation.clone(),
        );
        let handle = spawn_session(session, self.store.clone(), self.events.clone(), &self.config);
        sessions.insert(document_id, handle.clone());
        Ok(handle)
    }

    /// Live session, if any
    pub async fn get(&self, document_id: DocumentId) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&document_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Forget handles of sessions that shut down; returns how many
    pub async fn prune(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, handle| !handle.is_closed());
        before - sessions.len()
    }

    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|h| !h.is_closed()).count()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        join_all(handles.iter().map(|h| h.info()))
            .await
            .into_iter()
            .filter_map(|info| info.ok())
            .collect()
    }

    /// Stop every session, saving final snapshots
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        info!(count = handles.len(), "shutting down sessions");
        join_all(handles.iter().map(|h| h.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Content, MemorySnapshotStore, Operation, Snapshot, UserId};

    #[tokio::test]
    async fn test_get_or_create_reuses_live_session() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new(store, CollaborationConfig::default());
        let doc = DocumentId::new();

        let first = registry.get_or_create(doc).await.unwrap();
        first
            .submit(Operation::insert(doc, UserId::new(), 0, 0, "hi"))
            .await
            .unwrap();
        let second = registry.get_or_create(doc).await.unwrap();
        assert_eq!(second.state().await.unwrap().content.text, "hi");
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_session_seeded_from_store() {
        let store = Arc::new(MemorySnapshotStore::new());
        let doc = DocumentId::new();
        let mut state = DocumentState::with_content(doc, Content::with_text("stored"));
        state.version = 42;
        store.save_snapshot(&Snapshot::capture(&state, None)).await.unwrap();

        let registry = SessionRegistry::new(store, CollaborationConfig::default());
        let handle = registry.get_or_create(doc).await.unwrap();
        let loaded = handle.state().await.unwrap();
        assert_eq!(loaded.version, 42);
        assert_eq!(loaded.content.text, "stored");
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new(store.clone(), CollaborationConfig::default());
        let doc = DocumentId::new();

        let handle = registry.get_or_create(doc).await.unwrap();
        handle
            .submit(Operation::insert(doc, UserId::new(), 0, 0, "kept"))
            .await
            .unwrap();
        handle.shutdown().await.unwrap();
        assert!(registry.get(doc).await.is_none());

        let restarted = registry.get_or_create(doc).await.unwrap();
        let state = restarted.state().await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.content.text, "kept");
        assert_eq!(registry.prune().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_sessions() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SessionRegistry::new(store, CollaborationConfig::default());
        let a = registry.get_or_create(DocumentId::new()).await.unwrap();
        let b = registry.get_or_create(DocumentId::new()).await.unwrap();
        assert_eq!(registry.list_sessions().await.len(), 2);

        registry.shutdown().await;
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(registry.session_count().await, 0);
    }
}
