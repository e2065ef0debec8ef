//! Configuration infrastructure
//!
//! Contains configuration loading and management for the e-claim downloader.
//!
//! The retry/backoff constants, the minimum payload size and the rotation
//! threshold are policy values tuned against the portal's observed
//! rate-limiting behavior. They live here as configuration with those
//! empirical defaults rather than as hard constants.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Portal endpoints and login behavior
    pub portal: PortalConfig,

    /// Download policy (retries, delays, validation thresholds)
    pub downloader: DownloaderConfig,

    /// File system layout
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Endpoints and request behavior for the claims portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Base URL of the portal, no trailing slash
    pub base_url: String,

    /// Login form page, relative to the base URL
    pub login_path: String,

    /// Claim listing page, relative to the base URL
    pub listing_path: String,

    /// Form field name carrying the username
    pub username_field: String,

    /// Form field name carrying the password
    pub password_field: String,

    /// Text that must appear on the post-login page for a login to count
    /// as verified. An ambiguous response is treated as failure.
    pub login_success_marker: String,

    /// Per-request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Upper bound on requests per second for one session
    pub max_requests_per_second: u32,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://eclaim.example.go.th".to_string(),
            login_path: "/webComponent/login".to_string(),
            listing_path: "/webComponent/download/claimlist".to_string(),
            username_field: "username".to_string(),
            password_field: "password".to_string(),
            login_success_marker: "downloadMenu".to_string(),
            request_timeout_seconds: 120,
            max_requests_per_second: 2,
        }
    }
}

/// Download execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Retry attempts per file before it is recorded as failed
    pub max_retries: u32,

    /// Exponential backoff base delay in seconds
    pub backoff_base_seconds: u64,

    /// Backoff cap in seconds
    pub backoff_max_seconds: u64,

    /// Payloads smaller than this are rejected as error pages
    pub min_file_size_bytes: u64,

    /// Consecutive failures on one session before it is rotated
    pub rotation_error_threshold: u32,

    /// Smallest allowed worker count
    pub min_workers: usize,

    /// Largest allowed worker count
    pub max_workers: usize,

    /// Pause between sequential logins in milliseconds
    pub inter_login_delay_ms: u64,

    /// Politeness pause after each successful download in milliseconds
    pub inter_download_delay_ms: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_seconds: 5,
            backoff_max_seconds: 60,
            min_file_size_bytes: 100,
            rotation_error_threshold: 3,
            min_workers: 2,
            max_workers: 5,
            inter_login_delay_ms: 2000,
            inter_download_delay_ms: 1000,
        }
    }
}

impl DownloaderConfig {
    /// Clamp a requested worker count into the configured safe range.
    pub fn clamp_workers(&self, requested: usize) -> usize {
        requested.clamp(self.min_workers, self.max_workers)
    }

    /// Backoff delay for the given 1-based attempt number.
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let seconds = self
            .backoff_base_seconds
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_seconds);
        std::time::Duration::from_secs(seconds)
    }
}

/// File system layout for downloads and the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for downloaded claim files; one subdirectory per
    /// source type is created beneath it.
    pub download_dir: PathBuf,

    /// SQLite database file
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("eclaim-fetcher");
        Self {
            download_dir: data_dir.join("downloads"),
            database_path: data_dir.join("database").join("eclaim.db"),
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Log file name inside the log directory
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: true,
            file_name: "eclaim-fetcher.log".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            portal: PortalConfig::default(),
            downloader: DownloaderConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Configuration manager for loading and saving settings.
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory.
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("eclaim-fetcher");
        Ok(config_dir)
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join("eclaim_fetcher_config.json");
        Ok(Self { config_path })
    }

    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Load configuration from file, creating the default on first run.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Configuration file not found, creating default: {:?}",
                self.config_path
            );
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", self.config_path))?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_err) => {
                // Keep the corrupted file around for inspection and fall back
                // to defaults instead of refusing to start.
                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    tracing::warn!("Failed to back up corrupted config: {}", copy_err);
                }
                tracing::warn!(
                    "Config file is not valid JSON ({}), restoring defaults",
                    parse_err
                );
                let default_config = AppConfig::default();
                self.save_config(&default_config)
                    .await
                    .context("Failed to save default configuration")?;
                Ok(default_config)
            }
        }
    }

    /// Save configuration as pretty-printed JSON.
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .with_context(|| format!("Failed to write config file: {:?}", self.config_path))?;
        Ok(())
    }
}
