//! # Error Handling for the Cluster Journal
//!
//! A single error enum ([`Error`]) covers every failure mode of the journal.
//! Callers mostly want one decision from an error: retry, or give up. The
//! variants are grouped so that decision is easy to make.
//!
//! ## Error Categories
//!
//! | Category | Variant | Typical Response |
//! |----------|---------|------------------|
//! | Startup | `Configuration`, `Schema` | Fix the setup, do not retry |
//! | Transient | `Connectivity`, `TransactionAborted` | Retry the higher-level operation |
//! | Programmer error | `Consistency`, `InvalidState` | Fix the caller |
//! | Replay | `Consumer` | Inspect the consumer, re-run sync |
//!
//! ## Connection Teardown
//!
//! Every SQL failure inside the journal first tears down the connection that
//! produced it, then surfaces as [`Error::Connectivity`]. By the time a caller
//! sees the error, the next call already starts from a clean connection.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in journal operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Startup Errors (fatal)
    // =========================================================================

    /// A required setting is missing or invalid.
    ///
    /// Raised by [`JournalConfig::validate`](crate::config::JournalConfig::validate)
    /// and by providers that cannot make sense of their parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The journal tables are missing or could not be created.
    ///
    /// Fatal unless the schema check is disabled, in which case the first
    /// statement touching a missing table fails with `Connectivity` instead.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Transient Errors (retry)
    // =========================================================================

    /// A database operation failed and the connection was discarded.
    ///
    /// # Recovery
    ///
    /// Retry the higher-level operation (a save, a sync). The next journal call
    /// waits out the reconnect delay and opens a fresh connection.
    #[error("{operation} failed: {source}")]
    Connectivity {
        /// What the journal was doing, e.g. "lock", "append", "read records".
        operation: &'static str,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// The connection holding an open batch transaction was lost, so the
    /// transaction was rolled back by the database.
    ///
    /// # Recovery
    ///
    /// Call `unlock(false)` and retry the whole batch under a new lock.
    #[error("{operation} failed: batch transaction on connection generation {generation} was lost")]
    TransactionAborted {
        operation: &'static str,
        generation: u64,
    },

    // =========================================================================
    // Programmer Errors (fail loudly)
    // =========================================================================

    /// Lock bookkeeping was violated: unlock without a matching lock, or an
    /// append outside of a lock.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// An operation was invoked before its component was initialized, or
    /// after the journal was closed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    // =========================================================================
    // Replay Errors
    // =========================================================================

    /// A record consumer refused or failed to apply a record.
    #[error("consumer '{consumer_id}' failed: {message}")]
    Consumer {
        /// Id of the consumer that failed.
        consumer_id: String,
        /// Description supplied by the consumer.
        message: String,
    },

    // =========================================================================
    // Ambient Errors
    // =========================================================================

    /// Node-id file or legacy revision file could not be read or written.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps a SQLite error raised while performing `operation`.
    pub fn connectivity(operation: &'static str, source: rusqlite::Error) -> Self {
        Error::Connectivity { operation, source }
    }

    /// Returns true when the failed operation may succeed if retried.
    ///
    /// Only connectivity failures, including a lost batch transaction,
    /// qualify. Everything else needs a code or configuration change first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connectivity { .. } | Error::TransactionAborted { .. }
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
