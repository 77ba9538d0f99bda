//! Structured logging infrastructure for the RTI.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use crate::config::LoggingConfig;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging from configuration.
///
/// The `RUST_LOG` environment variable wins over `config.filter`. With
/// `config.json` set, events are written as JSON lines. Fails if a global
/// subscriber is already installed.
///
/// # Example
/// ```no_run
/// use ohla_core::{logging, LoggingConfig};
///
/// logging::init_with(&LoggingConfig::default()).unwrap();
/// tracing::info!(federation = "demo", "Federation created");
/// ```
pub fn init_with(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = env_filter(&config.filter);
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    }
}

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}
