//! Plugin error types

/// Errors raised by plugin loading and the plugin ABI
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dynamic library could not be opened
    #[error("open lib failed: {0}")]
    OpenLib(String),

    /// Required symbol missing from the library
    #[error("lib func not found: {0}")]
    SymbolNotFound(String),

    /// Plugin initialize returned a non-zero code
    #[error("plugin init failed: rtn {0}")]
    InitFailed(i32),

    /// Plugin report returned a non-zero code
    #[error("plugin report failed: rtn {0}")]
    ReportFailed(i32),

    /// Plugin join returned a non-zero code
    #[error("plugin join failed: rtn {0}")]
    JoinFailed(i32),

    /// Name already present in the process-wide registry
    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    /// Name absent from the process-wide registry
    #[error("plugin not registered: {0}")]
    NotRegistered(String),

    /// Static plugin slot released; the code itself stays resident
    #[error("static plugin {0} unloaded from registry, code stays resident")]
    StaticResident(String),
}

/// Result type for plugin operations
pub type Result<T> = std::result::Result<T, Error>;
