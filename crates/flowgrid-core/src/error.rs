//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
