//! # Structured Logging
//!
//! Installs the process-wide `tracing` subscriber. Library code only emits
//! events through `tracing` macros; calling [`init_logging`] is left to the
//! host binary or test harness.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::error::{BalancerError, BalancerResult};
use crate::observability::config::{LogConfig, LogFormat};

/// Install a global subscriber built from `config`
///
/// `RUST_LOG` takes precedence over `config.level`. Fails with a
/// configuration error if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> BalancerResult<()> {
    config.validate()?;
    let env_filter = build_filter(config)?;

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    result.map_err(|e| {
        BalancerError::config(format!("Tracing subscriber already initialized: {}", e))
    })?;

    info!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(())
}

fn build_filter(config: &LogConfig) -> BalancerResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| BalancerError::config(format!("Invalid log level: {}", e))),
    }
}
