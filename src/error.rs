//! Error taxonomy for the relay engine.
//!
//! Four failure classes with distinct propagation policies: transport
//! failures on queued writes are retried by the queue's backoff schedule,
//! transport failures on reads are absorbed (the cached list stands),
//! configuration errors surface before any network attempt, and storage
//! failures are fatal to the operation that hit them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The network call itself did not complete (unreachable, timeout).
    #[error("transport failure: {0}")]
    Transport(String),

    /// Missing or malformed webhook endpoint URL. Raised synchronously,
    /// never after a request has gone out.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The sheet script accepted the request but reported an application
    /// error in its JSON body.
    #[error("remote application error: {0}")]
    Remote(String),

    /// Local SQLite failure (corrupt payload, locked db, quota).
    #[error("local storage failure: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Storage(format!("serialized payload: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
