//! Repository for persisted download sessions
//!
//! Every mutation of a batch session is written through here so external
//! pollers and a restarted process see the last known state. The partial
//! unique index on (source_type) over non-terminal rows backs the "one
//! active batch per lane" guarantee at the storage level.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::domain::entities::{
    DownloadParams, DownloadSessionState, ProgressCounts, SessionStatus, SourceType,
};
use crate::domain::session_manager::SessionStore;

#[derive(Clone)]
pub struct SessionRepository {
    pool: Arc<SqlitePool>,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// All non-terminal sessions, across every lane.
    pub async fn find_active_all(&self) -> Result<Vec<DownloadSessionState>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM download_sessions
            WHERE status IN ('pending', 'discovering', 'downloading')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;
        rows.iter().map(map_session_row).collect()
    }

    /// Fail out sessions a dead process left in a non-terminal state.
    ///
    /// In-flight transfers were lost with the process; the history store
    /// makes a re-run cheap because finished files are skipped. Returns the
    /// number of sessions failed out.
    pub async fn recover_stale_sessions(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE download_sessions
            SET status = 'failed',
                error_message = 'interrupted by process restart',
                completed_at = ?,
                updated_at = ?
            WHERE status IN ('pending', 'discovering', 'downloading')
            "#,
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!("Failed out {} stale download session(s) from a previous run", recovered);
        }
        Ok(recovered)
    }
}

#[async_trait]
impl SessionStore for SessionRepository {
    async fn insert(&self, state: &DownloadSessionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO download_sessions
                (id, source_type, status, fiscal_year, service_month, scheme,
                 max_workers, auto_import, total_discovered, already_downloaded,
                 to_download, processed, downloaded, skipped, failed,
                 error_message, cancel_requested, created_at, started_at,
                 completed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.id)
        .bind(state.source_type.as_str())
        .bind(state.status.as_str())
        .bind(state.params.fiscal_year)
        .bind(state.params.service_month as i64)
        .bind(&state.params.scheme)
        .bind(state.params.max_workers as i64)
        .bind(state.params.auto_import)
        .bind(state.counts.total_discovered as i64)
        .bind(state.counts.already_downloaded as i64)
        .bind(state.counts.to_download as i64)
        .bind(state.counts.processed as i64)
        .bind(state.counts.downloaded as i64)
        .bind(state.counts.skipped as i64)
        .bind(state.counts.failed as i64)
        .bind(&state.error_message)
        .bind(state.cancel_requested)
        .bind(state.created_at)
        .bind(state.started_at)
        .bind(state.completed_at)
        .bind(state.updated_at)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("Failed to insert session {}", state.id))?;
        Ok(())
    }

    async fn update(&self, state: &DownloadSessionState) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE download_sessions SET
                status = ?, total_discovered = ?, already_downloaded = ?,
                to_download = ?, processed = ?, downloaded = ?, skipped = ?,
                failed = ?, error_message = ?, cancel_requested = ?,
                started_at = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.status.as_str())
        .bind(state.counts.total_discovered as i64)
        .bind(state.counts.already_downloaded as i64)
        .bind(state.counts.to_download as i64)
        .bind(state.counts.processed as i64)
        .bind(state.counts.downloaded as i64)
        .bind(state.counts.skipped as i64)
        .bind(state.counts.failed as i64)
        .bind(&state.error_message)
        .bind(state.cancel_requested)
        .bind(state.started_at)
        .bind(state.completed_at)
        .bind(state.updated_at)
        .bind(&state.id)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("Failed to update session {}", state.id))?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<DownloadSessionState>> {
        let row = sqlx::query("SELECT * FROM download_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&*self.pool)
            .await?;
        row.map(|r| map_session_row(&r)).transpose()
    }

    async fn find_active(
        &self,
        source_type: SourceType,
    ) -> Result<Option<DownloadSessionState>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM download_sessions
            WHERE source_type = ? AND status IN ('pending', 'discovering', 'downloading')
            "#,
        )
        .bind(source_type.as_str())
        .fetch_optional(&*self.pool)
        .await?;
        row.map(|r| map_session_row(&r)).transpose()
    }
}

fn map_session_row(row: &SqliteRow) -> Result<DownloadSessionState> {
    let source_type: String = row.get("source_type");
    let status: String = row.get("status");

    Ok(DownloadSessionState {
        id: row.get("id"),
        source_type: SourceType::parse(&source_type)
            .with_context(|| format!("Unknown source_type in sessions: {source_type}"))?,
        status: SessionStatus::parse(&status)
            .with_context(|| format!("Unknown status in sessions: {status}"))?,
        params: DownloadParams {
            fiscal_year: row.get("fiscal_year"),
            service_month: row.get::<i64, _>("service_month") as u32,
            scheme: row.get("scheme"),
            max_workers: row.get::<i64, _>("max_workers") as usize,
            auto_import: row.get::<i64, _>("auto_import") != 0,
        },
        counts: ProgressCounts {
            total_discovered: row.get::<i64, _>("total_discovered") as u64,
            already_downloaded: row.get::<i64, _>("already_downloaded") as u64,
            to_download: row.get::<i64, _>("to_download") as u64,
            processed: row.get::<i64, _>("processed") as u64,
            downloaded: row.get::<i64, _>("downloaded") as u64,
            skipped: row.get::<i64, _>("skipped") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        },
        error_message: row.get("error_message"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::DatabaseConnection;

    async fn repo() -> SessionRepository {
        let db = DatabaseConnection::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        SessionRepository::new(db.pool().clone())
    }

    fn sample_state(id: &str, source_type: SourceType) -> DownloadSessionState {
        let now = Utc::now();
        DownloadSessionState {
            id: id.to_string(),
            source_type,
            status: SessionStatus::Pending,
            params: DownloadParams {
                fiscal_year: 2568,
                service_month: 3,
                scheme: "UCS".to_string(),
                max_workers: 3,
                auto_import: false,
            },
            counts: ProgressCounts::default(),
            error_message: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn session_round_trips_through_storage() {
        let repo = repo().await;
        let mut state = sample_state("s-1", SourceType::Rep);
        repo.insert(&state).await.unwrap();

        state.status = SessionStatus::Downloading;
        state.counts.total_discovered = 10;
        state.counts.processed = 4;
        state.counts.downloaded = 3;
        state.counts.skipped = 1;
        state.started_at = Some(Utc::now());
        state.updated_at = Utc::now();
        repo.update(&state).await.unwrap();

        let loaded = repo.get("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Downloading);
        assert_eq!(loaded.counts.total_discovered, 10);
        assert_eq!(loaded.counts.processed, 4);
        assert_eq!(loaded.params.scheme, "UCS");
        assert!(loaded.started_at.is_some());

        let active = repo.find_active(SourceType::Rep).await.unwrap();
        assert_eq!(active.unwrap().id, "s-1");
        assert!(repo.find_active(SourceType::Stm).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_stale_sessions_fails_out_active_rows() {
        let repo = repo().await;
        repo.insert(&sample_state("stale-1", SourceType::Rep))
            .await
            .unwrap();
        repo.insert(&sample_state("stale-2", SourceType::Stm))
            .await
            .unwrap();

        let mut done = sample_state("done", SourceType::Smt);
        done.status = SessionStatus::Completed;
        done.completed_at = Some(Utc::now());
        repo.insert(&done).await.unwrap();

        let recovered = repo.recover_stale_sessions().await.unwrap();
        assert_eq!(recovered, 2);

        assert!(repo.find_active_all().await.unwrap().is_empty());
        let stale = repo.get("stale-1").await.unwrap().unwrap();
        assert_eq!(stale.status, SessionStatus::Failed);
        assert!(stale.completed_at.is_some());
        let untouched = repo.get("done").await.unwrap().unwrap();
        assert_eq!(untouched.status, SessionStatus::Completed);
    }
}
