//! Core error types

use std::time::Duration;

/// Errors raised by the latency client and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Client used before a successful connect
    #[error("client not initialized")]
    NotInitialized,

    /// Start called twice on the same client
    #[error("client already started")]
    AlreadyStarted,

    /// Backend round-trip or response decode failed
    #[error("read backend response failed: {0}")]
    ReadResponse(String),

    /// A bucket in the aggregation response was missing a required part
    #[error("parse aggregation failed: {what} in bucket {bucket:?}")]
    ParseAggregation {
        bucket: String,
        what: &'static str,
    },

    /// Query config rejected
    #[error("invalid query config: {0}")]
    InvalidQueryConfig(String),

    /// `set` called with a key outside the supported set
    #[error("unsupported config key: {0}")]
    UnsupportedConfigKey(String),

    /// Time range argument could not be parsed
    #[error("invalid time range arg: {0}")]
    InvalidTimeRange(String),

    /// Reporter registration rejected (empty name or duplicate)
    #[error("invalid reporter: {0}")]
    InvalidReporter(String),

    /// Reporter name not present in the registry
    #[error("reporter not found: {0}")]
    ReporterNotFound(String),

    /// Reporter callback failed
    #[error("reporter failed: {0}")]
    Reporter(String),

    /// Interval rejected (must be positive)
    #[error("invalid interval: {0:?}")]
    InvalidInterval(Duration),

    /// HTTP transport error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
