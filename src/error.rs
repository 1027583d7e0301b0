//! Error types for the minidex library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`MinidexError`] enum. The taxonomy is small on purpose: I/O failures,
//! corrupt on-disk data, capacity exhaustion, and invalid caller input.
//! "Term not found" is never an error; lookups return `Option` or an empty
//! result stream instead.

use std::io;

use thiserror::Error;

/// The main error type for minidex operations.
#[derive(Error, Debug)]
pub enum MinidexError {
    /// I/O errors (file operations, memory mapping, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum or format mismatch while reading on-disk data.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// The underlying storage cannot accept further writes.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Malformed query tree.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Operation not valid in the engine's current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with MinidexError.
pub type Result<T> = std::result::Result<T, MinidexError>;

impl MinidexError {
    /// Create a new corrupt-data error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        MinidexError::CorruptData(msg.into())
    }

    /// Create a new capacity-exceeded error.
    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        MinidexError::CapacityExceeded(msg.into())
    }

    /// Create a new invalid-query error.
    pub fn invalid_query<S: Into<String>>(msg: S) -> Self {
        MinidexError::InvalidQuery(msg.into())
    }

    /// Create a new invalid-operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        MinidexError::InvalidOperation(msg.into())
    }

    /// Create a new invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        MinidexError::Other(format!("Invalid argument: {}", msg.into()))
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        MinidexError::Other(msg.into())
    }
}
