//! Infrastructure layer for HTTP sessions, parsing, and persistence
//!
//! This module provides the portal HTTP client and fingerprint pool, the
//! SQLite connection and repositories, the listing-page discovery parser,
//! and the parallel fetch engine.

pub mod config;
pub mod database_connection;
pub mod discovery;
pub mod fetch_engine;
pub mod fingerprint;
pub mod history_repository;
pub mod http_client;
pub mod logging;
pub mod session_pool;
pub mod session_repository;

// Re-export commonly used items
pub use config::{AppConfig, ConfigManager, DownloaderConfig, PortalConfig};
pub use database_connection::DatabaseConnection;
pub use discovery::ClaimListExtractor;
pub use fetch_engine::{FetchEngine, FetchSummary};
pub use fingerprint::{BrowserFingerprint, FingerprintPool};
pub use history_repository::HistoryRepository;
pub use http_client::PortalClient;
pub use session_pool::SessionPool;
pub use session_repository::SessionRepository;
