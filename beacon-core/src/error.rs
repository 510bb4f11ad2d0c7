//! Error types for beacon-core

use thiserror::Error;

/// Main error type for the beacon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage is in a state the operation cannot work with
    #[error("storage error: {0}")]
    Storage(String),

    /// Network/transport error
    #[error("network error: {0}")]
    Network(String),

    /// Dispatcher id not registered with this instance
    #[error("unknown dispatcher: {0}")]
    UnknownDispatcher(String),

    /// Barrier id not registered with this instance
    #[error("unknown barrier: {0}")]
    UnknownBarrier(String),
}

/// Result type alias for beacon-core
pub type Result<T> = std::result::Result<T, Error>;
