//! Tracing setup for Shoal
//!
//! Console output follows the level the user picked; a debug log of the
//! whole run is written to disk next to it.

use std::fs::{File, create_dir_all};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run log file inside the logs directory.
pub const LAST_RUN_LOG: &str = "shoal-last-run.log";

/// Initialize tracing with console output at `console_level` and a full
/// trace log in `logs_dir` (defaults to "./logs").
///
/// `RUST_LOG` overrides the console level when set. The log file is
/// replaced on every run.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the logs directory or log file cannot be created
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;

    let log_file_path = logs_path.join(LAST_RUN_LOG);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={console_level}, debug_file={}",
        log_file_path.display()
    );
    Ok(())
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    /// # Examples
    /// ```
    /// use shoal_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Info.as_tracing_level(), tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_level_names_parse_back() {
        for level in CliLogLevel::value_variants() {
            let parsed = CliLogLevel::from_str(&level.to_string(), true).unwrap();
            assert_eq!(parsed, *level);
        }
        assert_eq!(CliLogLevel::Warn.as_tracing_level(), Level::WARN);
    }
}
