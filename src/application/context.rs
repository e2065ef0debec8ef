//! Shared application state
//!
//! Owns the configuration, the database pool and the repositories built on
//! it. Initialization runs the migrations and fails out sessions a previous
//! process left active, so the three lanes are always startable after a
//! restart.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::domain::session_manager::DownloadSessionManager;
use crate::infrastructure::config::{AppConfig, ConfigManager};
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::history_repository::HistoryRepository;
use crate::infrastructure::session_repository::SessionRepository;

pub struct AppContext {
    pub config: AppConfig,
    pub db: DatabaseConnection,
    pub history: HistoryRepository,
    pub session_repository: SessionRepository,
    pub session_manager: Arc<DownloadSessionManager>,
}

impl AppContext {
    /// Initialize from the user's configuration file, creating it with
    /// defaults on first run.
    pub async fn init() -> Result<Self> {
        let config = ConfigManager::new()?
            .load_config()
            .await
            .context("Failed to load application configuration")?;
        Self::with_config(config).await
    }

    /// Initialize against the database named in the given configuration.
    pub async fn with_config(config: AppConfig) -> Result<Self> {
        let database_url = format!("sqlite:{}", config.storage.database_path.display());
        let db = DatabaseConnection::new(&database_url)
            .await
            .with_context(|| format!("Failed to open database at {database_url}"))?;
        Self::build(config, db).await
    }

    /// Initialize over an in-memory database. Used by tests and the batch
    /// harness in dry-run mode.
    pub async fn in_memory(config: AppConfig) -> Result<Self> {
        let db = DatabaseConnection::in_memory().await?;
        Self::build(config, db).await
    }

    async fn build(config: AppConfig, db: DatabaseConnection) -> Result<Self> {
        db.migrate().await.context("Database migration failed")?;

        let history = HistoryRepository::new(db.pool().clone());
        let session_repository = SessionRepository::new(db.pool().clone());

        // In-flight transfers died with the previous process; their sessions
        // must not keep the lanes locked.
        let recovered = session_repository.recover_stale_sessions().await?;
        if recovered > 0 {
            info!("Recovered {} interrupted session(s) at startup", recovered);
        }

        let session_manager = Arc::new(DownloadSessionManager::new(Arc::new(
            session_repository.clone(),
        )));

        Ok(Self {
            config,
            db,
            history,
            session_repository,
            session_manager,
        })
    }
}
