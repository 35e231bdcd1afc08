//! Error types
//!
//! [`TxnError`] is the runtime taxonomy every engine operation reports.
//! None of its variants indicate a bug: engines release any locks they hold
//! before returning one. Bugs (unknown transaction codes, write-set
//! overflow, stashing during replay) panic instead.

use thiserror::Error;

/// Transaction outcome other than success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum TxnError {
    /// Key does not exist. The caller may create it on write.
    #[error("no such key")]
    NoKey,

    /// Validation or lock acquisition failed. Retry with backoff.
    #[error("transaction aborted")]
    Abort,

    /// A key is in split mode; the request is deferred to the epoch's join phase.
    #[error("transaction stashed until the next join phase")]
    Stash,

    /// Permanent business-level failure (duplicate key, insufficient quantity).
    #[error("transaction rejected; not retryable")]
    NoRetry,
}

impl TxnError {
    /// Whether retrying the same request can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxnError::Abort)
    }

    /// Whether the request was deferred rather than failed
    pub fn is_deferred(&self) -> bool {
        matches!(self, TxnError::Stash)
    }
}

/// Invalid engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its valid range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// What is wrong
        reason: String,
    },

    /// TOML input could not be parsed
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type for configuration loading
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
