//! Batch download orchestration
//!
//! Drives one batch per source type through the state machine:
//! `Pending → Discovering → Downloading → terminal`. The caller gets a
//! session id back immediately and polls progress; the batch itself runs
//! on a spawned task until it drains, fails, or is cancelled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::application::context::AppContext;
use crate::domain::entities::{
    Credential, DownloadParams, DownloadSessionState, ProgressCounts, SessionStatus, SourceType,
    sanitize_error,
};
use crate::domain::events::ProgressSink;
use crate::domain::session_manager::{DownloadSessionManager, SessionError};
use crate::infrastructure::discovery::ClaimListExtractor;
use crate::infrastructure::fetch_engine::FetchEngine;
use crate::infrastructure::fingerprint::FingerprintPool;
use crate::infrastructure::session_pool::SessionPool;

/// Forwards engine counter snapshots into the persisted session state.
struct SessionProgressSink {
    manager: Arc<DownloadSessionManager>,
    session_id: String,
}

#[async_trait]
impl ProgressSink for SessionProgressSink {
    async fn on_progress(&self, counts: ProgressCounts) {
        if let Err(err) = self
            .manager
            .update_progress(&self.session_id, counts)
            .await
        {
            warn!(
                "Progress update dropped for session {}: {}",
                self.session_id, err
            );
        }
    }
}

pub struct DownloadOrchestrator {
    context: Arc<AppContext>,
    extractor: Arc<ClaimListExtractor>,
    downloaded_files: Arc<Mutex<HashMap<String, Vec<PathBuf>>>>,
}

impl DownloadOrchestrator {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self {
            context,
            extractor: Arc::new(ClaimListExtractor::new()),
            downloaded_files: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a batch for one lane and return its session id.
    ///
    /// Fails with [`SessionError::Conflict`] while the lane has an active
    /// batch. The requested worker count is clamped into the configured
    /// range before any session is opened.
    pub async fn start_batch(
        &self,
        source_type: SourceType,
        mut params: DownloadParams,
        credentials: Vec<Credential>,
    ) -> Result<String, SessionError> {
        params.max_workers = self
            .context
            .config
            .downloader
            .clamp_workers(params.max_workers);

        let session_id = self
            .context
            .session_manager
            .create_session(source_type, params.clone())
            .await?;

        let context = Arc::clone(&self.context);
        let extractor = Arc::clone(&self.extractor);
        let downloaded_files = Arc::clone(&self.downloaded_files);
        let task_session_id = session_id.clone();
        tokio::spawn(async move {
            run_batch(
                context,
                extractor,
                downloaded_files,
                task_session_id,
                source_type,
                params,
                credentials,
            )
            .await;
        });

        Ok(session_id)
    }

    /// Current state of a session, including finalized ones.
    pub async fn get_progress(&self, session_id: &str) -> Option<DownloadSessionState> {
        self.context.session_manager.get_session(session_id).await
    }

    /// Request cooperative cancellation of a running batch.
    pub async fn cancel_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.context.session_manager.cancel_session(session_id).await
    }

    /// Whether the given lane is free for a new batch.
    pub async fn can_start_download(&self, source_type: SourceType) -> bool {
        self.context.session_manager.can_start(source_type).await
    }

    pub async fn get_active_sessions(&self) -> Vec<DownloadSessionState> {
        self.context.session_manager.get_active_sessions().await
    }

    /// Files written by a finished batch, handed over once for downstream
    /// import. Subsequent calls return an empty list.
    pub async fn take_downloaded_files(&self, session_id: &str) -> Vec<PathBuf> {
        self.downloaded_files
            .lock()
            .await
            .remove(session_id)
            .unwrap_or_default()
    }
}

async fn run_batch(
    context: Arc<AppContext>,
    extractor: Arc<ClaimListExtractor>,
    downloaded_files: Arc<Mutex<HashMap<String, Vec<PathBuf>>>>,
    session_id: String,
    source_type: SourceType,
    params: DownloadParams,
    credentials: Vec<Credential>,
) {
    let manager = Arc::clone(&context.session_manager);

    let result = execute_batch(
        &context,
        &extractor,
        &downloaded_files,
        &session_id,
        source_type,
        &params,
        &credentials,
    )
    .await;

    // Credential material must never reach the session row or the logs.
    let error = result
        .err()
        .map(|err| sanitize_error(&format!("{err:#}"), &credentials));
    if let Some(message) = &error {
        error!("Batch {} failed: {}", session_id, message);
    }

    match manager.complete_session(&session_id, error).await {
        Ok(final_status) => {
            info!("Batch {} finished as {:?}", session_id, final_status);
        }
        Err(err) => {
            error!("Could not finalize session {}: {}", session_id, err);
        }
    }
}

async fn execute_batch(
    context: &Arc<AppContext>,
    extractor: &ClaimListExtractor,
    downloaded_files: &Mutex<HashMap<String, Vec<PathBuf>>>,
    session_id: &str,
    source_type: SourceType,
    params: &DownloadParams,
    credentials: &[Credential],
) -> Result<()> {
    let manager = &context.session_manager;
    let config = &context.config;

    manager
        .set_status(session_id, SessionStatus::Discovering)
        .await?;

    let portal = Arc::new(config.portal.clone());
    let mut pool = SessionPool::new(
        FingerprintPool::new(),
        Arc::clone(&portal),
        &config.downloader,
    );
    let healthy = pool
        .initialize(params.max_workers, credentials)
        .await
        .context("Session pool initialization failed")?;
    if healthy == 0 {
        anyhow::bail!("No session could authenticate against the portal");
    }

    let cancel = manager
        .cancellation_token(session_id)
        .await
        .with_context(|| format!("No cancellation token for session {session_id}"))?;

    // Discovery runs on a single session; the listing is one page.
    let primary = pool
        .primary()
        .context("Session pool reported healthy but has no sessions")?;
    let candidates = {
        let slot = primary.lock().await;
        extractor
            .discover(&slot.client, params, &cancel)
            .await
            .context("Candidate discovery failed")?
    };

    manager
        .set_status(session_id, SessionStatus::Downloading)
        .await?;
    let sink = Arc::new(SessionProgressSink {
        manager: Arc::clone(manager),
        session_id: session_id.to_string(),
    });

    let download_dir = config.storage.download_dir.join(source_type.as_str());
    let engine = FetchEngine::new(
        context.history.clone(),
        config.downloader.clone(),
        download_dir,
    );
    let summary = engine
        .run(
            Arc::new(pool),
            source_type,
            params,
            candidates,
            sink,
            cancel,
        )
        .await?;

    if params.auto_import && !summary.downloaded_files.is_empty() {
        mark_batch_imported(context, source_type, &summary.downloaded_files).await;
    }

    downloaded_files
        .lock()
        .await
        .insert(session_id.to_string(), summary.downloaded_files);
    Ok(())
}

/// Flag this batch's files as imported. Failures are logged, not fatal:
/// the files are on disk and the import flag can be fixed by a later sync.
async fn mark_batch_imported(
    context: &AppContext,
    source_type: SourceType,
    files: &[PathBuf],
) {
    let mut ids = Vec::new();
    for path in files {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match context.history.get(source_type, filename).await {
            Ok(Some(record)) => ids.push(record.id),
            Ok(None) => warn!("Downloaded file {} missing from history", filename),
            Err(err) => warn!("History lookup failed for {}: {}", filename, err),
        }
    }

    match context.history.mark_imported(&ids).await {
        Ok(marked) => info!("Marked {} file(s) as imported", marked),
        Err(err) => warn!("Import flagging failed: {}", err),
    }
}
