//! Control-plane error types

use std::time::Duration;

/// Errors raised by the control server, handlers and clients
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Message carried the wrong type tag for the requested payload
    #[error("invalid msg type: {0}")]
    InvalidMsgType(String),

    /// Message payload could not be decoded
    #[error("invalid msg data: {0}")]
    InvalidMsgData(String),

    /// Server constructed with unusable arguments
    #[error("invalid ctl server args: {0}")]
    ServerArgs(String),

    /// Connection URI scheme outside {ipc, tcp}
    #[error("unsupported connection scheme: {0}")]
    UnsupportedScheme(String),

    /// Handler egress or ingress queue stayed full past its budget
    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    /// Handler already released or never started
    #[error("handler unavailable: {0}")]
    HandlerUnavailable(String),

    /// Client transport is gone
    #[error("ctl connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Core(#[from] frontrank_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for control-plane operations
pub type Result<T> = std::result::Result<T, Error>;
