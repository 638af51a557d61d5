//! Error types for the Kontos library.
//!
//! This module provides error handling for all Kontos operations.
//! All errors are represented by the [`KontosError`] enum, which carries
//! enough detail for the writer to decide between discarding a buffer,
//! rejecting a single document, or surfacing the failure to the caller.

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Kontos operations.
///
/// This enum represents all possible errors that can occur in the Kontos
/// library. It uses the `thiserror` crate for automatic `Error` trait
/// implementation and provides convenient constructor methods for creating
/// specific error types.
#[derive(Error, Debug)]
pub enum KontosError {
    /// I/O errors (file operations, sync, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The hard document-count ceiling would be exceeded
    #[error("Too many documents: {pending} pending, limit is {limit}")]
    TooManyDocs {
        /// Documents currently reserved across the index.
        pending: u64,
        /// Configured hard ceiling.
        limit: u64,
    },

    /// A failure that may have corrupted a buffer's in-memory state;
    /// the whole buffer must be discarded
    #[error("Aborting document error: {0}")]
    Aborting(String),

    /// A failure isolated to a single document; the buffer stays usable
    /// and the document is flagged deleted
    #[error("Document error: {0}")]
    Document(String),

    /// Flush I/O failed; the owning ticket is marked failed
    #[error("Flush failed: {0}")]
    FlushFailed(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with KontosError.
pub type Result<T> = std::result::Result<T, KontosError>;

impl KontosError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        KontosError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        KontosError::Storage(msg.into())
    }

    /// Create a new aborting document error.
    pub fn aborting<S: Into<String>>(msg: S) -> Self {
        KontosError::Aborting(msg.into())
    }

    /// Create a new non-aborting document error.
    pub fn document<S: Into<String>>(msg: S) -> Self {
        KontosError::Document(msg.into())
    }

    /// Create a new flush failure error.
    pub fn flush_failed<S: Into<String>>(msg: S) -> Self {
        KontosError::FlushFailed(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        KontosError::InvalidOperation(msg.into())
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        KontosError::OperationCancelled(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        KontosError::Other(msg.into())
    }

    /// Whether this error requires the owning write buffer to be discarded.
    pub fn is_aborting(&self) -> bool {
        matches!(self, KontosError::Aborting(_))
    }
}
