//! Error types for marketfeed
//!
//! This module provides the error taxonomy for the library:
//! - Fetch errors, split into transient (retried) and permanent kinds
//! - Cache write errors (read-side corruption degrades to a cache miss
//!   instead of surfacing here)
//! - Checkpoint errors, which are fatal for a run
//! - A top-level [`Error`] with context conversions

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for marketfeed operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for marketfeed
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "worker_count")
        key: Option<String>,
    },

    /// Upstream fetch failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Cache store write failed
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Checkpoint ledger operation failed
    ///
    /// Any checkpoint write failure is fatal for the run: an unpersisted
    /// checkpoint risks silently skipping a subject on resume.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Run cancelled - not accepting new work
    #[error("run cancelled: not accepting new work")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Upstream fetch errors
///
/// The transient variants (`Timeout`, `Throttled`, `Network`) are retried
/// with exponential backoff and never mutate the cache. The remaining
/// variants are permanent and fail the subject immediately.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Upstream request timed out
    #[error("upstream timeout")]
    Timeout,

    /// Upstream signalled throttling (rate limit)
    #[error("throttled by upstream (retry after {retry_after_secs}s)")]
    Throttled {
        /// Seconds the upstream asked us to wait before retrying
        retry_after_secs: u64,
    },

    /// Transient network failure (connection reset, DNS, etc.)
    #[error("network error: {0}")]
    Network(String),

    /// Subject is unknown or delisted upstream
    #[error("subject unknown or delisted: {subject}")]
    SubjectUnknown {
        /// The subject the upstream rejected
        subject: String,
    },

    /// Upstream rejected the request with a non-retriable response
    #[error("upstream rejected request: {0}")]
    Rejected(String),

    /// Fetch returned an empty series and no prior record exists to fall back on
    #[error("empty series returned for {subject}")]
    EmptySeries {
        /// The subject whose fetch came back empty
        subject: String,
    },
}

impl FetchError {
    /// Returns true for transient failures that should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout | FetchError::Throttled { .. } | FetchError::Network(_)
        )
    }
}

/// Cache store write errors
///
/// Only the write path surfaces errors; a corrupt or unreadable record on
/// the read path is logged and treated as a cache miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Failed to create a cache directory
    #[error("failed to create cache directory {path}: {reason}")]
    CreateDirFailed {
        /// The directory that could not be created
        path: PathBuf,
        /// The underlying failure
        reason: String,
    },

    /// Failed to write a record or index file
    #[error("failed to write {path}: {reason}")]
    WriteFailed {
        /// The file that could not be written
        path: PathBuf,
        /// The underlying failure
        reason: String,
    },

    /// Atomic rename of a temp file into place failed
    #[error("atomic rename failed for {path}: {reason}")]
    RenameFailed {
        /// The destination path of the failed rename
        path: PathBuf,
        /// The underlying failure
        reason: String,
    },

    /// Failed to serialize a record before writing
    #[error("failed to serialize record for {subject}: {reason}")]
    Serialization {
        /// The subject whose record failed to serialize
        subject: String,
        /// The underlying failure
        reason: String,
    },
}

/// Checkpoint ledger errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Failed to connect to the checkpoint database
    #[error("failed to connect to checkpoint database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}
