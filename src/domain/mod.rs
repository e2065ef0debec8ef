//! Domain module - Core business logic and entities
//!
//! This module contains the typed records shared across the pipeline,
//! the progress event interface, and the batch session state machine.

pub mod entities;
pub mod events;
pub mod session_manager;

// Re-export commonly used items
pub use entities::*;
pub use events::*;
pub use session_manager::{DownloadSessionManager, SessionError};
