//! Configuration loading for the Ledgerline client.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use ledgerline_core::{CsvQuoting, DeletePolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub const CONFIG_ENV_VAR: &str = "LEDGERLINE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub auth: AuthConfig,
    pub request_timeout_ms: u64,
    /// Directory exported CSV files are written to.
    pub export_dir: PathBuf,
    pub csv_quoting: CsvQuoting,
    pub udf_delete_policy: DeletePolicy,
    /// Fallback `EnvFilter` directives when `RUST_LOG` is unset.
    pub log_filter: String,
    pub log_format: LogFormat,
}

/// Static credentials attached to every request. Both are optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or LEDGERLINE_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ClientConfig {
    /// Locate, parse and validate the configuration.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.api_base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.auth.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "auth.api_key",
                reason: "must not be empty when set".to_string(),
            });
        }
        if self.auth.jwt.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "auth.jwt",
                reason: "must not be empty when set".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.export_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "export_dir",
                reason: "must not be empty".to_string(),
            });
        }
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log_filter",
                reason: "must not be empty".to_string(),
            });
        }
        if let Err(e) = EnvFilter::try_new(&self.log_filter) {
            return Err(ConfigError::InvalidValue {
                field: "log_filter",
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
