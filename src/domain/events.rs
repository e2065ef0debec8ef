//! Progress event interface between the fetch engine and observers
//!
//! The fetch engine reports counters through an explicit sink trait instead
//! of external code wrapping its internals; the session manager is the
//! production implementation and tests plug in their own recorders.

use async_trait::async_trait;

use crate::domain::entities::ProgressCounts;

/// Outcome of processing one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Downloaded,
    Skipped,
    Failed,
}

/// Receives a counters snapshot after every processed item.
///
/// Implementations must be cheap and must not block the worker for long;
/// the engine calls this while holding no other locks.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, counts: ProgressCounts);
}

/// Sink that drops every update. Useful for maintenance runs and tests
/// that only care about the final summary.
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn on_progress(&self, _counts: ProgressCounts) {}
}
