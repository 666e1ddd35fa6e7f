//! Tracing setup shared by the proxy and the operator CLI.
//!
//! Provides:
//! - Verbosity-driven level selection, overridable with `RUST_LOG`
//! - Optional append-to-file output
//! - Text or JSON format

use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Crates whose events pass the default filter.
const LOG_TARGETS: &[&str] = &[
    "rascsi_core",
    "rascsi_control",
    "rascsi_files",
    "rascsi_proxy",
    "rascsi_ctl",
];

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Map a `-v` count onto a level name (0=error .. 4+=trace).
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Build the default directive string for a level.
fn default_directives(level: &str) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize the global subscriber.
///
/// # Arguments
///
/// * `verbosity` - Verbosity level (0=error, 1=warn, 2=info, 3=debug, 4+=trace)
/// * `log_file` - Optional path; logs are appended when set
/// * `format` - Output format (text or JSON)
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = level_for_verbosity(verbosity);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    let detailed = verbosity >= 3;

    let init_err = |e: tracing_subscriber::util::TryInitError| {
        Error::Io(std::io::Error::other(e.to_string()))
    };

    match (log_file, format) {
        (None, LogFormat::Text) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(detailed)
                    .with_line_number(detailed),
            )
            .try_init()
            .map_err(init_err)?,
        (None, LogFormat::Json) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(init_err)?,
        (Some(path), LogFormat::Text) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true)
                        .with_file(detailed)
                        .with_line_number(detailed),
                )
                .try_init()
                .map_err(init_err)?
        }
        (Some(path), LogFormat::Json) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(file))
                .try_init()
                .map_err(init_err)?
        }
    }

    Ok(())
}

/// Initialize logging for tests; a second call is a no-op.
pub fn init_test_logging() {
    let _ = init_logging(2, None, LogFormat::Text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_default() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for_verbosity(0), "error");
        assert_eq!(level_for_verbosity(2), "info");
        assert_eq!(level_for_verbosity(3), "debug");
        assert_eq!(level_for_verbosity(9), "trace");
    }

    #[test]
    fn directives_cover_every_crate() {
        let directives = default_directives("debug");
        for target in LOG_TARGETS {
            assert!(directives.contains(&format!("{}=debug", target)));
        }
    }

    #[test]
    fn repeated_test_init_is_harmless() {
        init_test_logging();
        init_test_logging();
    }
}
