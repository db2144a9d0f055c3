//! Logging bootstrap
//!
//! Installs a `tracing-subscriber` fmt subscriber driven by [`LogConfig`].
//! `RUST_LOG` directives take precedence over the configured level.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{Result, SwitchError};

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| SwitchError::config(format!("Invalid log level: {}", level)))
}

/// Set up the logging system with the provided configuration
///
/// Fails if a global subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let span_events = if config.log_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| SwitchError::config(format!("logging already initialised: {}", e)))?;

    tracing::info!("🚀 Starting {} v{}", config.app_name, env!("CARGO_PKG_VERSION"));
    Ok(())
}
