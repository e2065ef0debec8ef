//! Typed records for the download pipeline
//!
//! The portal's original integration passed dict-shaped rows around; here
//! every record that crosses a component boundary is an explicit struct so
//! field access is checked at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the three independent download lanes on the portal.
///
/// Each lane has its own history namespace and its own "at most one active
/// batch" exclusivity rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Claim representation files
    Rep,
    /// Statement files
    Stm,
    /// Summary statement files
    Smt,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Rep => "rep",
            SourceType::Stm => "stm",
            SourceType::Smt => "smt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rep" => Some(SourceType::Rep),
            "stm" => Some(SourceType::Stm),
            "smt" => Some(SourceType::Smt),
            _ => None,
        }
    }

    pub fn all() -> [SourceType; 3] {
        [SourceType::Rep, SourceType::Stm, SourceType::Smt]
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single file in the download history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Success,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Success => "success",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DownloadStatus::Pending),
            "downloading" => Some(DownloadStatus::Downloading),
            "success" => Some(DownloadStatus::Success),
            "failed" => Some(DownloadStatus::Failed),
            _ => None,
        }
    }
}

/// State machine for a batch download session.
///
/// `Pending → Discovering → Downloading → {Completed | Failed | Cancelled}`.
/// Terminal states are final; there is no transition out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Discovering,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Discovering => "discovering",
            SessionStatus::Downloading => "downloading",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SessionStatus::Pending),
            "discovering" => Some(SessionStatus::Discovering),
            "downloading" => Some(SessionStatus::Downloading),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// Portal login credential, supplied by an external credential provider.
///
/// The core only consumes an ordered list and filters on `enabled`;
/// storage and encryption of secrets live outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub secret: String,
    pub label: String,
    pub enabled: bool,
}

/// A discovered, not-yet-downloaded file reference.
///
/// Produced fresh by discovery each batch; either skipped against history
/// or turned into a history record by the fetch engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub url: String,
    pub filename: String,
    pub file_type: Option<String>,
    pub size_hint: Option<i64>,
}

impl Candidate {
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
            file_type: None,
            size_hint: None,
        }
    }
}

/// Payload for a history upsert. `None` fields never overwrite stored values.
#[derive(Debug, Clone, Default)]
pub struct NewDownload {
    pub filename: String,
    pub document_no: Option<String>,
    pub scheme: Option<String>,
    pub fiscal_year: Option<i64>,
    pub service_month: Option<i64>,
    pub file_size: Option<i64>,
    pub file_path: Option<String>,
    pub content_hash: Option<String>,
    pub source_url: Option<String>,
    pub error_message: Option<String>,
}

/// A row in the download history, uniquely keyed by (download_type, filename).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub download_type: SourceType,
    pub filename: String,
    pub document_no: Option<String>,
    pub scheme: Option<String>,
    pub fiscal_year: Option<i64>,
    pub service_month: Option<i64>,
    pub file_size: Option<i64>,
    pub file_path: Option<String>,
    pub content_hash: Option<String>,
    pub source_url: Option<String>,
    pub status: DownloadStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub file_exists: bool,
    pub imported: bool,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for one batch, scoped to a single (month, year, scheme) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadParams {
    pub fiscal_year: i64,
    pub service_month: u32,
    pub scheme: String,
    pub max_workers: usize,
    pub auto_import: bool,
}

/// Running counters for one batch session.
///
/// Once discovery is complete, `processed == downloaded + skipped + failed`
/// holds after every item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub total_discovered: u64,
    pub already_downloaded: u64,
    pub to_download: u64,
    pub processed: u64,
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl ProgressCounts {
    pub fn progress_percent(&self) -> f64 {
        if self.total_discovered == 0 {
            0.0
        } else {
            self.processed as f64 / self.total_discovered as f64 * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_discovered > 0 && self.processed == self.total_discovered
    }
}

/// Persisted state of one batch download session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSessionState {
    pub id: String,
    pub source_type: SourceType,
    pub status: SessionStatus,
    pub params: DownloadParams,
    pub counts: ProgressCounts,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadSessionState {
    pub fn progress_percent(&self) -> f64 {
        self.counts.progress_percent()
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Strip credential material out of an error message before it is persisted
/// or logged. Usernames and secrets must never reach the history table.
pub fn sanitize_error(message: &str, credentials: &[Credential]) -> String {
    let mut sanitized = message.to_string();
    for credential in credentials {
        if !credential.secret.is_empty() {
            sanitized = sanitized.replace(&credential.secret, "***");
        }
        if !credential.username.is_empty() {
            sanitized = sanitized.replace(&credential.username, "***");
        }
    }
    sanitized
}
