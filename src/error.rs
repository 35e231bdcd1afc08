//! Error types for the phasekv facade
//!
//! Engine-level outcomes ([`TxnError`]) and configuration problems
//! ([`ConfigError`]) are folded into one [`Error`] so applications can use
//! `?` across the whole API.

use phasekv_core::{ConfigError, TxnError};
use thiserror::Error;

/// Result type for phasekv operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`PhaseKv`](crate::PhaseKv)
#[derive(Debug, Error)]
pub enum Error {
    /// Key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Transaction aborted on a conflict; retry with backoff
    #[error("conflict: {0}")]
    Conflict(String),

    /// Request was stashed; its reply arrives after the next join phase
    #[error("deferred until the next join phase")]
    Deferred,

    /// Business-level rejection; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),

    /// Invalid configuration or builder input
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine has been shut down
    #[error("engine is shut down")]
    Closed,

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same request can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if the request was deferred rather than failed
    pub fn is_deferred(&self) -> bool {
        matches!(self, Error::Deferred)
    }

    /// Whether the error points at misuse or a broken engine rather than
    /// a normal transaction outcome
    pub fn is_serious(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Closed | Error::Internal(_))
    }
}

impl From<TxnError> for Error {
    fn from(e: TxnError) -> Self {
        match e {
            TxnError::NoKey => Error::NotFound(e.to_string()),
            TxnError::Abort => Error::Conflict(e.to_string()),
            TxnError::Stash => Error::Deferred,
            TxnError::NoRetry => Error::Rejected(e.to_string()),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
