//! eclaim-fetcher - Parallel claim-file downloader for the e-claim portal
//!
//! This crate implements the discovery → dedupe → parallel-fetch → persist
//! pipeline for Excel claim files served by a session-bound, rate-limited
//! government portal. Callers (a web API layer, a scheduler) drive batches
//! through [`application::DownloadOrchestrator`] and poll progress; the
//! download history and batch state survive process restarts in SQLite.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;

// Re-export the caller-facing surface
pub use application::{AppContext, DownloadOrchestrator};
pub use domain::entities::{
    Candidate, Credential, DownloadParams, DownloadStatus, ProgressCounts, SessionStatus,
    SourceType,
};
