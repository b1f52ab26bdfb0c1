//! ==============================================================================
//! logging.rs - tracing subscriber setup
//! ==============================================================================
//!
//! purpose:
//!     installs the global `tracing` subscriber once at startup. `RUST_LOG`
//!     wins over the configured level so a single run can be made verbose
//!     without touching `host.toml`.
//!
//! relationships:
//!     - uses: config.rs (LoggingConfig)
//!     - used by: main.rs
//!
//! ==============================================================================

use std::io;

use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log level '{level}': {reason}")]
    InvalidLevel { level: String, reason: String },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the console subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    tracing_subscriber::registry()
        .with(console_layer(config, filter))
        .try_init()?;
    Ok(())
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidLevel {
        level: config.level.clone(),
        reason: e.to_string(),
    })
}

fn console_layer(config: &LoggingConfig, filter: EnvFilter) -> BoxedLayer {
    let writer = io::stdout;
    match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(config.show_target)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(config.show_target)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(config.show_target)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    }
}
