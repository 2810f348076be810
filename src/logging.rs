//! Logging initialization.
//!
//! One entry point driven by the `[logging]` configuration section: stderr
//! by default, an append-mode file when `logging.file` is set (so external
//! rotation keeps working across restarts). `RUST_LOG` always wins over the
//! configured level.

use crate::config::LoggingConfig;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// A configured log file that cannot be opened is reported on stderr and
/// logging falls back to stderr rather than aborting startup.
pub fn init(config: &LoggingConfig) {
    let filter = resolve_filter(&config.level);

    if let Some(path) = &config.file {
        match open_log_file(path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(file)
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not open log file {}: {e}; logging to stderr",
                    path.display()
                );
            }
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `RUST_LOG` when set, the configured level otherwise.
fn resolve_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Opens the configured log file for appending, creating missing parents.
fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}
