//! History store errors

use thiserror::Error;

use crate::record::EvalStatus;

/// Errors from history store operations
#[derive(Debug, Error)]
pub enum HistoryError {
    /// A result was written to a row that already returned
    #[error("Row {id} already returned; second write rejected")]
    AlreadyReturned { id: u64 },

    /// A result arrived for a row id that was never appended
    #[error("Result for unknown row id {id} (store holds {len} rows)")]
    UnknownId { id: u64, len: u64 },

    /// A point does not match the store's dimensionality
    #[error("Dimension mismatch: expected {expected} values, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// An evaluation does not match the store's objective shape
    #[error("Objective shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// A returned row must carry a terminal status
    #[error("Status {0} is not valid for a returned row")]
    InvalidStatus(EvalStatus),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HistoryError {
    /// True for violations of the single-writer / known-id contract
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::AlreadyReturned { .. } | Self::UnknownId { .. })
    }
}

/// Result alias for history store operations
pub type Result<T> = std::result::Result<T, HistoryError>;
