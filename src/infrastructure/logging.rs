//! Logging system configuration and initialization
//!
//! Console and file output through tracing-subscriber; the file layer uses
//! a non-blocking appender whose worker guard must stay alive for the
//! lifetime of the process.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::infrastructure::config::LoggingConfig;

// Keeps the non-blocking writer guards alive after init returns.
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> =
        Mutex::new(Vec::new());
}

/// Log directory next to the executable, falling back to the working dir.
pub fn get_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    exe_dir.join("logs")
}

/// Initialize the logging system with default configuration.
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize console and/or file logging per the given configuration.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console_layer = if config.console_output {
        Some(tracing_subscriber::fmt::layer().with_target(false).boxed())
    } else {
        None
    };

    let file_layer = if config.file_output {
        let log_dir = get_log_directory();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

        let appender = tracing_appender::rolling::never(&log_dir, &config.file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        LOG_GUARDS
            .lock()
            .expect("log guard mutex poisoned")
            .push(guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!("Logging initialized (level: {})", config.level);
    Ok(())
}
