//! Application layer wiring the domain and infrastructure together

pub mod context;
pub mod orchestrator;

pub use context::AppContext;
pub use orchestrator::DownloadOrchestrator;
