//! Repository for the download history table
//!
//! The single source of truth for "already downloaded". Rows are uniquely
//! keyed by (download_type, filename) and updated in place on every attempt
//! for the same file; the upsert never produces a second row.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, sqlite::SqliteRow};

use crate::domain::entities::{DownloadStatus, HistoryRecord, NewDownload, SourceType};

/// Filter for history queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub download_type: Option<SourceType>,
    pub fiscal_year: Option<i64>,
    pub scheme: Option<String>,
    pub status: Option<DownloadStatus>,
    pub imported: Option<bool>,
    pub file_exists: Option<bool>,
}

/// Aggregate statistics for one download lane.
#[derive(Debug, Clone, Default)]
pub struct HistoryStats {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub pending: i64,
    pub downloading: i64,
    pub total_bytes: i64,
    pub first_download_at: Option<DateTime<Utc>>,
    pub last_download_at: Option<DateTime<Utc>>,
}

/// Result of re-syncing `file_exists` flags against the filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSyncReport {
    pub checked: u64,
    pub missing: u64,
    pub restored: u64,
    pub deleted: u64,
}

#[derive(Clone)]
pub struct HistoryRepository {
    pool: Arc<SqlitePool>,
}

impl HistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Whether a file is already downloaded and can be skipped.
    ///
    /// True only for a record in status success/downloading whose file (when
    /// `check_file_exists` is set) is actually present on disk. A record
    /// whose file has gone missing is corrected to `file_exists = 0` and
    /// reported as not downloaded. Store errors degrade to `false`: a
    /// redundant download beats silently skipping a needed one.
    pub async fn is_downloaded(
        &self,
        download_type: SourceType,
        filename: &str,
        check_file_exists: bool,
    ) -> bool {
        let row = match sqlx::query(
            r#"
            SELECT id, file_path, file_exists FROM download_history
            WHERE download_type = ? AND filename = ? AND status IN ('success', 'downloading')
            "#,
        )
        .bind(download_type.as_str())
        .bind(filename)
        .fetch_optional(&*self.pool)
        .await
        {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!("History lookup failed for {}: {}", filename, err);
                return false;
            }
        };

        let Some(row) = row else {
            return false;
        };

        if !check_file_exists {
            return true;
        }

        let id: i64 = row.get("id");
        let file_path: Option<String> = row.get("file_path");
        let flagged_exists: bool = row.get::<i64, _>("file_exists") != 0;

        let on_disk = file_path
            .as_deref()
            .map(|p| Path::new(p).exists())
            .unwrap_or(false);

        if on_disk {
            if !flagged_exists {
                if let Err(err) = self.set_file_exists(id, true).await {
                    tracing::warn!("Failed to restore file_exists flag: {}", err);
                }
            }
            true
        } else {
            // Self-healing: the DB said downloaded but the disk disagrees.
            if let Err(err) = self.set_file_exists(id, false).await {
                tracing::warn!("Failed to clear file_exists flag: {}", err);
            }
            tracing::info!("File missing on disk, will re-download: {}", filename);
            false
        }
    }

    /// Upsert a download attempt, keyed by (download_type, filename).
    ///
    /// On conflict, non-null incoming size/path/hash values win over stored
    /// ones. Moving to `failed` increments `retry_count`; moving to
    /// `success` resets it to 0 and stamps `downloaded_at`;
    /// `last_attempt_at` always refreshes. Returns the row id.
    pub async fn record_download(
        &self,
        download_type: SourceType,
        data: &NewDownload,
        status: DownloadStatus,
    ) -> Result<i64> {
        let now = Utc::now();
        let initial_retry_count: i64 = if status == DownloadStatus::Failed { 1 } else { 0 };
        let downloaded_at = if status == DownloadStatus::Success {
            Some(now)
        } else {
            None
        };
        let file_exists = data.file_path.is_some() && status == DownloadStatus::Success;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO download_history
                (download_type, filename, document_no, scheme, fiscal_year, service_month,
                 file_size, file_path, content_hash, source_url, status, retry_count,
                 error_message, file_exists, downloaded_at, last_attempt_at,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (download_type, filename) DO UPDATE SET
                document_no = COALESCE(excluded.document_no, document_no),
                scheme = COALESCE(excluded.scheme, scheme),
                fiscal_year = COALESCE(excluded.fiscal_year, fiscal_year),
                service_month = COALESCE(excluded.service_month, service_month),
                file_size = COALESCE(excluded.file_size, file_size),
                file_path = COALESCE(excluded.file_path, file_path),
                content_hash = COALESCE(excluded.content_hash, content_hash),
                source_url = COALESCE(excluded.source_url, source_url),
                status = excluded.status,
                retry_count = CASE
                    WHEN excluded.status = 'failed' THEN download_history.retry_count + 1
                    WHEN excluded.status = 'success' THEN 0
                    ELSE download_history.retry_count
                END,
                error_message = excluded.error_message,
                file_exists = excluded.file_exists OR download_history.file_exists,
                downloaded_at = CASE
                    WHEN excluded.status = 'success' THEN excluded.last_attempt_at
                    ELSE download_history.downloaded_at
                END,
                last_attempt_at = excluded.last_attempt_at,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(download_type.as_str())
        .bind(&data.filename)
        .bind(&data.document_no)
        .bind(&data.scheme)
        .bind(data.fiscal_year)
        .bind(data.service_month)
        .bind(data.file_size)
        .bind(&data.file_path)
        .bind(&data.content_hash)
        .bind(&data.source_url)
        .bind(status.as_str())
        .bind(initial_retry_count)
        .bind(&data.error_message)
        .bind(file_exists)
        .bind(downloaded_at)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .with_context(|| format!("Failed to record download for {}", data.filename))?;

        Ok(id)
    }

    /// Record a failed attempt with its (already sanitized) error message.
    pub async fn record_failed_download(
        &self,
        download_type: SourceType,
        data: &NewDownload,
        error_message: &str,
    ) -> Result<i64> {
        let mut failed = data.clone();
        failed.error_message = Some(error_message.to_string());
        self.record_download(download_type, &failed, DownloadStatus::Failed)
            .await
    }

    /// Flip every failed record of the lane back to pending so a later batch
    /// re-attempts them. Returns the number of rows reset.
    pub async fn reset_failed_for_retry(&self, download_type: SourceType) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE download_history
            SET status = 'pending', error_message = NULL, updated_at = ?
            WHERE download_type = ? AND status = 'failed'
            "#,
        )
        .bind(Utc::now())
        .bind(download_type.as_str())
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Fetch a single record by its natural key.
    pub async fn get(
        &self,
        download_type: SourceType,
        filename: &str,
    ) -> Result<Option<HistoryRecord>> {
        let row = sqlx::query(
            "SELECT * FROM download_history WHERE download_type = ? AND filename = ?",
        )
        .bind(download_type.as_str())
        .bind(filename)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(|r| map_history_row(&r)).transpose()
    }

    /// Query records matching the filter, newest attempts first.
    pub async fn find(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM download_history WHERE 1=1");

        if let Some(download_type) = filter.download_type {
            builder.push(" AND download_type = ");
            builder.push_bind(download_type.as_str());
        }
        if let Some(fiscal_year) = filter.fiscal_year {
            builder.push(" AND fiscal_year = ");
            builder.push_bind(fiscal_year);
        }
        if let Some(scheme) = &filter.scheme {
            builder.push(" AND scheme = ");
            builder.push_bind(scheme.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(imported) = filter.imported {
            builder.push(" AND imported = ");
            builder.push_bind(imported);
        }
        if let Some(file_exists) = filter.file_exists {
            builder.push(" AND file_exists = ");
            builder.push_bind(file_exists);
        }
        builder.push(" ORDER BY last_attempt_at DESC, id DESC");

        let rows = builder.build().fetch_all(&*self.pool).await?;
        rows.iter().map(map_history_row).collect()
    }

    /// Aggregate statistics for one lane.
    pub async fn stats(&self, download_type: SourceType) -> Result<HistoryStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) AS success,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'downloading' THEN 1 ELSE 0 END), 0) AS downloading,
                COALESCE(SUM(CASE WHEN status = 'success' THEN file_size ELSE 0 END), 0) AS total_bytes,
                MIN(downloaded_at) AS first_download_at,
                MAX(downloaded_at) AS last_download_at
            FROM download_history
            WHERE download_type = ?
            "#,
        )
        .bind(download_type.as_str())
        .fetch_one(&*self.pool)
        .await?;

        Ok(HistoryStats {
            total: row.get("total"),
            success: row.get("success"),
            failed: row.get("failed"),
            pending: row.get("pending"),
            downloading: row.get("downloading"),
            total_bytes: row.get("total_bytes"),
            first_download_at: row.get("first_download_at"),
            last_download_at: row.get("last_download_at"),
        })
    }

    /// Re-verify `file_exists` for every record of the lane against the
    /// filesystem, optionally deleting orphans (missing on disk and never
    /// imported).
    pub async fn sync_file_flags(
        &self,
        download_type: SourceType,
        delete_orphans: bool,
    ) -> Result<FileSyncReport> {
        let rows = sqlx::query(
            "SELECT id, file_path, file_exists FROM download_history WHERE download_type = ?",
        )
        .bind(download_type.as_str())
        .fetch_all(&*self.pool)
        .await?;

        let mut report = FileSyncReport::default();
        for row in rows {
            report.checked += 1;
            let id: i64 = row.get("id");
            let file_path: Option<String> = row.get("file_path");
            let flagged_exists = row.get::<i64, _>("file_exists") != 0;

            let on_disk = file_path
                .as_deref()
                .map(|p| Path::new(p).exists())
                .unwrap_or(false);

            if on_disk && !flagged_exists {
                self.set_file_exists(id, true).await?;
                report.restored += 1;
            } else if !on_disk {
                if flagged_exists {
                    self.set_file_exists(id, false).await?;
                }
                report.missing += 1;
            }
        }

        if delete_orphans {
            let result = sqlx::query(
                r#"
                DELETE FROM download_history
                WHERE download_type = ? AND file_exists = 0 AND imported = 0
                "#,
            )
            .bind(download_type.as_str())
            .execute(&*self.pool)
            .await?;
            report.deleted = result.rows_affected();
        }

        Ok(report)
    }

    /// Flag records as ingested by the external importer.
    pub async fn mark_imported(&self, ids: &[i64]) -> Result<u64> {
        let mut affected = 0;
        for id in ids {
            let result =
                sqlx::query("UPDATE download_history SET imported = 1, updated_at = ? WHERE id = ?")
                    .bind(Utc::now())
                    .bind(id)
                    .execute(&*self.pool)
                    .await?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    async fn set_file_exists(&self, id: i64, exists: bool) -> Result<()> {
        sqlx::query("UPDATE download_history SET file_exists = ?, updated_at = ? WHERE id = ?")
            .bind(exists)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}

fn map_history_row(row: &SqliteRow) -> Result<HistoryRecord> {
    let download_type: String = row.get("download_type");
    let status: String = row.get("status");

    Ok(HistoryRecord {
        id: row.get("id"),
        download_type: SourceType::parse(&download_type)
            .with_context(|| format!("Unknown download_type in history: {download_type}"))?,
        filename: row.get("filename"),
        document_no: row.get("document_no"),
        scheme: row.get("scheme"),
        fiscal_year: row.get("fiscal_year"),
        service_month: row.get("service_month"),
        file_size: row.get("file_size"),
        file_path: row.get("file_path"),
        content_hash: row.get("content_hash"),
        source_url: row.get("source_url"),
        status: DownloadStatus::parse(&status)
            .with_context(|| format!("Unknown status in history: {status}"))?,
        retry_count: row.get("retry_count"),
        error_message: row.get("error_message"),
        file_exists: row.get::<i64, _>("file_exists") != 0,
        imported: row.get::<i64, _>("imported") != 0,
        downloaded_at: row.get("downloaded_at"),
        last_attempt_at: row.get("last_attempt_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
