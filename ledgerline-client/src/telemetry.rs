//! Tracing subscriber setup.

use crate::config::{ClientConfig, LogFormat};
use crate::error::{ClientError, ClientResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; `fallback_filter` is used when it is unset
/// or unparseable. Fails if a global subscriber is already installed.
pub fn init_tracing(fallback_filter: &str, format: LogFormat) -> ClientResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(fallback_filter)
            .map_err(|e| ClientError::Telemetry(format!("Invalid log filter: {}", e)))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.map_err(|e| ClientError::Telemetry(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(log_filter = fallback_filter, format = ?format, "Tracing initialized");
    Ok(())
}

/// [`init_tracing`] with the filter and format from `config`.
pub fn init_from_config(config: &ClientConfig) -> ClientResult<()> {
    init_tracing(&config.log_filter, config.log_format)
}
