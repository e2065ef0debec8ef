//! Batch session state machine with persisted progress
//!
//! One logical download batch per source type (rep/stm/smt) at a time.
//! Live state is kept in memory for fast polling and written through to a
//! [`SessionStore`] on every mutation, so a process restart can recover the
//! last known counters even though in-flight transfers are lost.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::entities::{
    DownloadParams, DownloadSessionState, ProgressCounts, SessionStatus, SourceType,
};

/// Durable storage for [`DownloadSessionState`], implemented over SQLite in
/// the infrastructure layer and over a plain map in tests.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, state: &DownloadSessionState) -> anyhow::Result<()>;
    async fn update(&self, state: &DownloadSessionState) -> anyhow::Result<()>;
    async fn get(&self, session_id: &str) -> anyhow::Result<Option<DownloadSessionState>>;
    async fn find_active(&self, source_type: SourceType)
    -> anyhow::Result<Option<DownloadSessionState>>;
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("an active {0} download session already exists")]
    Conflict(SourceType),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} is already in a terminal state")]
    Terminal(String),

    #[error("session storage error: {0}")]
    Storage(String),
}

impl SessionError {
    fn storage(err: anyhow::Error) -> Self {
        SessionError::Storage(err.to_string())
    }
}

/// Thread-safe manager for batch download sessions.
pub struct DownloadSessionManager {
    store: Arc<dyn SessionStore>,
    sessions: RwLock<HashMap<String, DownloadSessionState>>,
    cancel_tokens: RwLock<HashMap<String, CancellationToken>>,
}

impl DownloadSessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            cancel_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new session for the given lane.
    ///
    /// Fails with [`SessionError::Conflict`] when a non-terminal session
    /// already exists for the same source type; the other two lanes are
    /// unaffected.
    pub async fn create_session(
        &self,
        source_type: SourceType,
        params: DownloadParams,
    ) -> Result<String, SessionError> {
        // Hold the write lock across the conflict check and the insert so two
        // concurrent callers cannot both pass the check.
        let mut sessions = self.sessions.write().await;

        let in_memory_conflict = sessions
            .values()
            .any(|s| s.source_type == source_type && s.is_active());
        if in_memory_conflict {
            return Err(SessionError::Conflict(source_type));
        }

        // A previous process may have left an active row behind.
        if let Some(existing) = self
            .store
            .find_active(source_type)
            .await
            .map_err(SessionError::storage)?
        {
            if !sessions.contains_key(&existing.id) {
                return Err(SessionError::Conflict(source_type));
            }
        }

        let now = Utc::now();
        let state = DownloadSessionState {
            id: Uuid::new_v4().to_string(),
            source_type,
            status: SessionStatus::Pending,
            params,
            counts: ProgressCounts::default(),
            error_message: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        self.store
            .insert(&state)
            .await
            .map_err(SessionError::storage)?;

        let session_id = state.id.clone();
        sessions.insert(session_id.clone(), state);
        drop(sessions);

        self.cancel_tokens
            .write()
            .await
            .insert(session_id.clone(), CancellationToken::new());

        tracing::info!("Created {} download session: {}", source_type, session_id);
        Ok(session_id)
    }

    /// Error for a session id absent from the live map: finalized sessions
    /// are reported as terminal, unknown ids as not found.
    async fn missing_session_error(&self, session_id: &str) -> SessionError {
        match self.store.get(session_id).await {
            Ok(Some(state)) if state.status.is_terminal() => {
                SessionError::Terminal(session_id.to_string())
            }
            _ => SessionError::NotFound(session_id.to_string()),
        }
    }

    /// Move a session to a new (non-terminal) stage.
    pub async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let Some(state) = sessions.get_mut(session_id) else {
            drop(sessions);
            return Err(self.missing_session_error(session_id).await);
        };

        if state.status.is_terminal() {
            return Err(SessionError::Terminal(session_id.to_string()));
        }

        if status == SessionStatus::Discovering && state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        state.status = status;
        state.updated_at = Utc::now();

        self.store
            .update(state)
            .await
            .map_err(SessionError::storage)
    }

    /// Thread-safe counter update, persisted immediately so external pollers
    /// see monotonic progress.
    pub async fn update_progress(
        &self,
        session_id: &str,
        counts: ProgressCounts,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let Some(state) = sessions.get_mut(session_id) else {
            drop(sessions);
            return Err(self.missing_session_error(session_id).await);
        };

        state.counts = counts;
        state.updated_at = Utc::now();

        self.store
            .update(state)
            .await
            .map_err(SessionError::storage)
    }

    /// Request cooperative cancellation.
    ///
    /// The fetch engine consults the token between items; in-flight transfers
    /// for already-dispatched items are allowed to finish. The final state
    /// becomes `Cancelled` when the batch drains.
    pub async fn cancel_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let Some(state) = sessions.get_mut(session_id) else {
            drop(sessions);
            return Err(self.missing_session_error(session_id).await);
        };

        if state.status.is_terminal() {
            return Err(SessionError::Terminal(session_id.to_string()));
        }

        state.cancel_requested = true;
        state.updated_at = Utc::now();
        self.store
            .update(state)
            .await
            .map_err(SessionError::storage)?;
        drop(sessions);

        if let Some(token) = self.cancel_tokens.read().await.get(session_id) {
            token.cancel();
        }
        tracing::info!("Cancellation requested for session {}", session_id);
        Ok(())
    }

    /// Finalize a session and release its lane.
    ///
    /// Resolution order: a pending cancellation wins over everything, then a
    /// supplied error makes the session `Failed`, otherwise `Completed`.
    pub async fn complete_session(
        &self,
        session_id: &str,
        error: Option<String>,
    ) -> Result<SessionStatus, SessionError> {
        let mut sessions = self.sessions.write().await;
        let Some(state) = sessions.get_mut(session_id) else {
            drop(sessions);
            return Err(self.missing_session_error(session_id).await);
        };

        if state.status.is_terminal() {
            return Err(SessionError::Terminal(session_id.to_string()));
        }

        let final_status = if state.cancel_requested {
            SessionStatus::Cancelled
        } else if error.is_some() {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };

        state.status = final_status;
        state.error_message = error;
        state.completed_at = Some(Utc::now());
        state.updated_at = Utc::now();

        self.store
            .update(state)
            .await
            .map_err(SessionError::storage)?;

        // Finalized sessions live on in storage only; the in-memory map
        // holds active batches and stays bounded over process lifetime.
        sessions.remove(session_id);
        drop(sessions);

        self.cancel_tokens.write().await.remove(session_id);

        tracing::info!("Session {} finalized as {:?}", session_id, final_status);
        Ok(final_status)
    }

    /// Cancellation token for the fetch engine to watch.
    pub async fn cancellation_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.cancel_tokens.read().await.get(session_id).cloned()
    }

    /// Current session state, falling back to storage for sessions finalized
    /// by an earlier process.
    pub async fn get_session(&self, session_id: &str) -> Option<DownloadSessionState> {
        if let Some(state) = self.sessions.read().await.get(session_id) {
            return Some(state.clone());
        }
        self.store.get(session_id).await.ok().flatten()
    }

    /// All sessions currently in a non-terminal state.
    pub async fn get_active_sessions(&self) -> Vec<DownloadSessionState> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    /// Whether a new batch may start on the given lane.
    pub async fn can_start(&self, source_type: SourceType) -> bool {
        let in_memory = self
            .sessions
            .read()
            .await
            .values()
            .any(|s| s.source_type == source_type && s.is_active());
        if in_memory {
            return false;
        }
        match self.store.find_active(source_type).await {
            Ok(existing) => existing.is_none(),
            Err(err) => {
                tracing::warn!("Session store lookup failed, refusing start: {}", err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Map-backed store for exercising the manager without SQLite.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<HashMap<String, DownloadSessionState>>,
    }

    #[async_trait]
    impl SessionStore for MemoryStore {
        async fn insert(&self, state: &DownloadSessionState) -> anyhow::Result<()> {
            self.rows
                .lock()
                .unwrap()
                .insert(state.id.clone(), state.clone());
            Ok(())
        }

        async fn update(&self, state: &DownloadSessionState) -> anyhow::Result<()> {
            self.rows
                .lock()
                .unwrap()
                .insert(state.id.clone(), state.clone());
            Ok(())
        }

        async fn get(&self, session_id: &str) -> anyhow::Result<Option<DownloadSessionState>> {
            Ok(self.rows.lock().unwrap().get(session_id).cloned())
        }

        async fn find_active(
            &self,
            source_type: SourceType,
        ) -> anyhow::Result<Option<DownloadSessionState>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .find(|s| s.source_type == source_type && s.is_active())
                .cloned())
        }
    }

    fn test_params() -> DownloadParams {
        DownloadParams {
            fiscal_year: 2568,
            service_month: 3,
            scheme: "UCS".to_string(),
            max_workers: 3,
            auto_import: false,
        }
    }

    fn manager() -> DownloadSessionManager {
        DownloadSessionManager::new(Arc::new(MemoryStore::default()))
    }

    #[tokio::test]
    async fn second_session_on_same_lane_conflicts() {
        let manager = manager();
        let first = manager
            .create_session(SourceType::Rep, test_params())
            .await
            .unwrap();

        let err = manager
            .create_session(SourceType::Rep, test_params())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Conflict(SourceType::Rep)));

        // Other lanes are independent.
        manager
            .create_session(SourceType::Stm, test_params())
            .await
            .unwrap();
        manager
            .create_session(SourceType::Smt, test_params())
            .await
            .unwrap();

        // Completing the rep session releases the lane.
        manager.complete_session(&first, None).await.unwrap();
        assert!(manager.can_start(SourceType::Rep).await);
        manager
            .create_session(SourceType::Rep, test_params())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lifecycle_reaches_completed_with_counts() {
        let manager = manager();
        let id = manager
            .create_session(SourceType::Stm, test_params())
            .await
            .unwrap();

        manager
            .set_status(&id, SessionStatus::Discovering)
            .await
            .unwrap();
        manager
            .set_status(&id, SessionStatus::Downloading)
            .await
            .unwrap();

        let counts = ProgressCounts {
            total_discovered: 10,
            already_downloaded: 6,
            to_download: 4,
            processed: 10,
            downloaded: 4,
            skipped: 6,
            failed: 0,
        };
        manager.update_progress(&id, counts).await.unwrap();

        let status = manager.complete_session(&id, None).await.unwrap();
        assert_eq!(status, SessionStatus::Completed);

        let state = manager.get_session(&id).await.unwrap();
        assert_eq!(state.counts, counts);
        assert_eq!(
            state.counts.downloaded + state.counts.skipped + state.counts.failed,
            state.counts.processed
        );
        assert!(state.completed_at.is_some());
        assert!(state.started_at.is_some());
    }

    #[tokio::test]
    async fn cancellation_wins_over_completion() {
        let manager = manager();
        let id = manager
            .create_session(SourceType::Smt, test_params())
            .await
            .unwrap();

        let token = manager.cancellation_token(&id).await.unwrap();
        assert!(!token.is_cancelled());

        manager.cancel_session(&id).await.unwrap();
        assert!(token.is_cancelled());

        let status = manager.complete_session(&id, None).await.unwrap();
        assert_eq!(status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn finalized_sessions_are_served_from_storage_only() {
        let store = Arc::new(MemoryStore::default());
        let manager = DownloadSessionManager::new(store.clone());

        let id = manager
            .create_session(SourceType::Rep, test_params())
            .await
            .unwrap();
        manager.complete_session(&id, None).await.unwrap();
        assert!(manager.get_active_sessions().await.is_empty());

        // Lookups for the finalized session go through the store.
        let state = manager.get_session(&id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Completed);

        // Nothing is held in memory: with the stored row gone the session
        // is gone, so the map cannot grow one entry per completed batch.
        store.rows.lock().unwrap().remove(&id);
        assert!(manager.get_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn terminal_sessions_reject_further_transitions() {
        let manager = manager();
        let id = manager
            .create_session(SourceType::Rep, test_params())
            .await
            .unwrap();
        manager
            .complete_session(&id, Some("discovery failed".to_string()))
            .await
            .unwrap();

        let state = manager.get_session(&id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Failed);

        assert!(matches!(
            manager.set_status(&id, SessionStatus::Downloading).await,
            Err(SessionError::Terminal(_))
        ));
        assert!(matches!(
            manager.cancel_session(&id).await,
            Err(SessionError::Terminal(_))
        ));
        assert!(matches!(
            manager.complete_session(&id, None).await,
            Err(SessionError::Terminal(_))
        ));
    }
}
