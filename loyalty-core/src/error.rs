//! Error types for the loyalty ledger
//!
//! Errors fall into two classes that callers must treat differently:
//!
//! - **Validation** errors are rejected synchronously and never queued.
//! - **Transient** errors mean the store could not be reached; the operation
//!   is handed to the retry queue instead of being lost.
//!
//! Configuration problems are not errors at all: they resolve to defaults via
//! [`Resolution`].

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Redemption larger than the current balance
    #[error("Insufficient balance on {account}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        /// Account being debited
        account: String,
        /// Balance at the time of the check
        balance: Decimal,
        /// Points requested
        requested: Decimal,
    },

    /// Malformed input (zero amount, sign mismatch, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Account does not exist
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account exists but may not transact
    #[error("Account {0} is not active")]
    AccountInactive(String),

    /// Limit guard denied the operation
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// Store unreachable or write failed; safe to retry
    #[error("Transient persistence error: {0}")]
    TransientPersistence(String),

    /// Derived operation replayed before the operation it depends on
    #[error("Parent operation {0} has not committed yet")]
    ParentPending(uuid::Uuid),

    /// Account version moved between read and write
    #[error("Version conflict on {account}: expected {expected}, found {found}")]
    VersionConflict {
        /// Account being written
        account: String,
        /// Version the writer read
        expected: u64,
        /// Version present in the store
        found: u64,
    },

    /// Operation did not finish within its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller should queue the operation for replay
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientPersistence(_)
                | Error::ParentPending(_)
                | Error::VersionConflict { .. }
                | Error::Timeout(_)
                | Error::Storage(_)
                | Error::Concurrency(_)
                | Error::Io(_)
        )
    }

    /// Whether the operation was rejected on its merits
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance { .. }
                | Error::InvalidInput(_)
                | Error::AccountNotFound(_)
                | Error::AccountInactive(_)
                | Error::LimitExceeded(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

/// A value that fell back to a default because its source was unusable.
///
/// Carries both the substituted default and the cause, so a caller can
/// either propagate the failure or keep going with `default`.
#[derive(Debug, Clone)]
pub struct Degraded<T> {
    /// The hardcoded safe default
    pub default: T,
    /// Why the real value could not be used
    pub cause: String,
}

/// Outcome of a lookup that never fails outright
pub type Resolution<T> = std::result::Result<T, Degraded<T>>;

/// Helpers for consuming a [`Resolution`]
pub trait ResolutionExt<T> {
    /// Take the resolved value, or log a warning and take the default
    fn or_fallback(self, what: &str) -> T;

    /// Treat a fallback as a configuration error
    fn strict(self) -> Result<T>;
}

impl<T> ResolutionExt<T> for Resolution<T> {
    fn or_fallback(self, what: &str) -> T {
        match self {
            Ok(value) => value,
            Err(degraded) => {
                tracing::warn!(what, cause = %degraded.cause, "Falling back to default");
                degraded.default
            }
        }
    }

    fn strict(self) -> Result<T> {
        self.map_err(|d| Error::Config(d.cause))
    }
}

/// Build a degraded resolution
pub fn degraded<T>(default: T, cause: impl Into<String>) -> Resolution<T> {
    Err(Degraded {
        default,
        cause: cause.into(),
    })
}
