//! Centralized Logging Infrastructure
//!
//! Provides structured logging with:
//! - Compact console output
//! - Optional file logging with daily rotation
//! - `RUST_LOG` override with per-crate defaults

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,mcpstream_core=debug,mcpstream_gateway=debug";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for rolling log files; `None` disables file logging
    pub directory: Option<PathBuf>,
    /// Log file name prefix (files are `<prefix>.<date>.log`)
    pub file_prefix: String,
    /// Colored console output
    pub ansi: bool,
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
            file_prefix: "mcpstream".to_string(),
            ansi: true,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Platform data directory for logs (e.g. `~/.local/share/mcpstream/logs`)
pub fn default_log_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("mcpstream").join("logs"))
}

/// Install the global subscriber
///
/// Returns the file writer guard, which must be kept alive for the
/// duration of the program. Does nothing if a subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    // Console layer: compact
    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .compact()
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let (file_layer, guard) = match config.directory.as_ref().and_then(|dir| file_appender(config, dir)) {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // File layer: no colors, include more detail
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn file_appender(config: &LogConfig, dir: &Path) -> Option<RollingFileAppender> {
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Warning: Failed to create logs directory {}: {}", dir.display(), e);
        return None;
    }

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(dir)
    {
        Ok(appender) => Some(appender),
        Err(e) => {
            eprintln!("Warning: Failed to create log file appender: {}", e);
            None
        }
    }
}
