use std::path::PathBuf;
use thiserror::Error;

/// Startup configuration failures.  All of these are fatal: the daemon
/// reports them and exits without touching audio or the indicator.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least 2 stations are required for crossfading, got {0}")]
    TooFewStations(usize),

    #[error("overlay effect pool is empty")]
    EmptyEffectPool,

    #[error("overlay blend pool is empty")]
    EmptyBlendPool,

    #[error("overlay blend pool needs at least one noise-classified track")]
    BlendPoolWithoutNoise,

    #[error("invalid value for {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    #[error("failed to read station file {path:?}: {source}")]
    StationFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse station file {path:?}: {source}")]
    StationFileParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOption {
            option,
            reason: reason.into(),
        }
    }
}
