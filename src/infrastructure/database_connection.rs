// Database connection and pool management
// This module handles SQLite database connections using sqlx

use std::path::Path;

use anyhow::Result;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create the database file and its directory if missing
        let db_path = if database_url.starts_with("sqlite://") {
            database_url.trim_start_matches("sqlite://")
        } else if database_url.starts_with("sqlite:") {
            database_url.trim_start_matches("sqlite:")
        } else {
            database_url
        };

        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if !Path::new(db_path).exists() {
                std::fs::File::create(db_path)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// In-memory database, used by tests and the development harness.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_history_sql = r#"
            CREATE TABLE IF NOT EXISTS download_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                download_type TEXT NOT NULL,
                filename TEXT NOT NULL,
                document_no TEXT,
                scheme TEXT,
                fiscal_year INTEGER,
                service_month INTEGER,
                file_size INTEGER,
                file_path TEXT,
                content_hash TEXT,
                source_url TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                file_exists INTEGER NOT NULL DEFAULT 1,
                imported INTEGER NOT NULL DEFAULT 0,
                downloaded_at DATETIME,
                last_attempt_at DATETIME,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (download_type, filename)
            )
        "#;

        let create_sessions_sql = r#"
            CREATE TABLE IF NOT EXISTS download_sessions (
                id TEXT PRIMARY KEY,
                source_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                fiscal_year INTEGER NOT NULL,
                service_month INTEGER NOT NULL,
                scheme TEXT NOT NULL,
                max_workers INTEGER NOT NULL,
                auto_import INTEGER NOT NULL DEFAULT 0,
                total_discovered INTEGER NOT NULL DEFAULT 0,
                already_downloaded INTEGER NOT NULL DEFAULT 0,
                to_download INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                downloaded INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                started_at DATETIME,
                completed_at DATETIME,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#;

        // One non-terminal session per source type, enforced by the store
        // itself so a crashed process cannot leave two active lanes behind.
        let create_indexes_sql = r#"
            CREATE INDEX IF NOT EXISTS idx_history_type_status
                ON download_history (download_type, status);
            CREATE INDEX IF NOT EXISTS idx_history_scheme_year
                ON download_history (scheme, fiscal_year);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_lane
                ON download_sessions (source_type)
                WHERE status IN ('pending', 'discovering', 'downloading');
            CREATE INDEX IF NOT EXISTS idx_sessions_status
                ON download_sessions (status);
        "#;

        sqlx::query(create_history_sql).execute(&self.pool).await?;
        sqlx::query(create_sessions_sql).execute(&self.pool).await?;
        for statement in create_indexes_sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_database_connection() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("test.db");
        let database_url = format!("sqlite:{}", db_path.to_string_lossy());

        let db = DatabaseConnection::new(&database_url).await?;
        assert!(!db.pool().is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn test_database_migration() -> Result<()> {
        let db = DatabaseConnection::in_memory().await?;
        tokio_test::assert_ok!(db.migrate().await);

        for table in ["download_history", "download_sessions"] {
            let result =
                sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
                    .bind(table)
                    .fetch_optional(db.pool())
                    .await?;
            assert!(result.is_some(), "missing table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn active_lane_index_rejects_second_active_session() -> Result<()> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;

        let insert = |id: &str, status: &str| {
            let pool = db.pool().clone();
            let id = id.to_string();
            let status = status.to_string();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO download_sessions
                        (id, source_type, status, fiscal_year, service_month, scheme, max_workers)
                    VALUES (?, 'rep', ?, 2568, 3, 'UCS', 3)
                    "#,
                )
                .bind(id)
                .bind(status)
                .execute(&pool)
                .await
            }
        };

        insert("a", "downloading").await?;
        // A second active rep session violates the partial unique index.
        assert!(insert("b", "discovering").await.is_err());
        // Terminal rows are not constrained.
        insert("c", "completed").await?;
        insert("d", "failed").await?;
        Ok(())
    }
}
