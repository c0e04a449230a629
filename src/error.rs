//! Error types for EmberDB

use thiserror::Error;

/// Result type alias for EmberDB operations
pub type Result<T> = std::result::Result<T, EmberError>;

/// EmberDB error types
#[derive(Error, Debug)]
pub enum EmberError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller violated a precondition
    #[error("Bad argument: {0}")]
    BadArg(String),

    /// Parse or format failure in input data
    #[error("Bad data: {0}")]
    BadData(String),

    /// Series id is not registered
    #[error("Series not found: {0}")]
    NotFound(u64),

    /// Read hit a block that was recycled by volume rotation
    #[error("Block at address {0:#x} was overwritten")]
    Overwrite(u64),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Out-of-order write rejected
    #[error("Late write: timestamp {ts} is not past {last}")]
    Late { ts: u64, last: u64 },

    /// Block store is full
    #[error("Out of space")]
    OutOfSpace,

    /// Caller asked for a query shape the engine does not support
    #[error("Query error: {0}")]
    QueryParsing(String),
}

impl EmberError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmberError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EmberError::Corruption(_) | EmberError::ChecksumMismatch { .. }
        )
    }
}
