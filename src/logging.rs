//! Process-wide log setup: console on stderr plus an append-only file
//! under `OUTPUT_DIR/logs/`. `RUST_LOG` overrides the default filter.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const DEFAULT_FILTER: &str = "debug";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unable to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a global logger is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// `OUTPUT_DIR/logs/<name>.log`
pub fn log_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join("logs").join(format!("{name}.log"))
}

pub fn init_logging(log_file: &Path) -> Result<(), LoggingError> {
    let open_error = |source| LoggingError::File {
        path: log_file.to_path_buf(),
        source,
    };
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent).map_err(open_error)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(open_error)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()?;
    Ok(())
}

/// Console-only logging for short-lived tools.
pub fn init_console_logging(default_filter: &str) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_layout() {
        let path = log_path(Path::new("/flight/out"), "radio-003");
        assert_eq!(path, PathBuf::from("/flight/out/logs/radio-003.log"));
    }
}
