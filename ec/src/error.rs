//! Coordinator error taxonomy
//!
//! Per-point failures (timeout, execution error) are contained by the
//! workers and turned into penalty values; the variants here surface when a
//! caller asks for them explicitly. Configuration, divergence and integrity
//! errors are fatal to a run.

use historystore::HistoryError;
use thiserror::Error;

use crate::pipeline::PipelineError;

/// Errors from the evaluation coordinator
#[derive(Debug, Error)]
pub enum CoordError {
    /// Invalid bounds, mismatched parameter counts, unknown step type, ...
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline step exceeded its wall-clock budget
    #[error("Pipeline timeout: {0}")]
    PipelineTimeout(String),

    /// A pipeline step exited abnormally or could not be launched
    #[error("Pipeline execution error: {0}")]
    PipelineExecution(String),

    /// The local optimizer cannot proceed
    #[error("Optimizer divergence: {0}")]
    OptimizerDivergence(String),

    /// The message contract was violated (double write, unknown id)
    #[error("History integrity violation: {0}")]
    HistoryIntegrity(#[source] HistoryError),

    /// Any other history store failure
    #[error("History error: {0}")]
    History(#[source] HistoryError),

    /// A coordinator channel closed unexpectedly
    #[error("Channel closed: {0}")]
    Channel(String),
}

impl CoordError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for errors that must abort the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::PipelineTimeout(_) | Self::PipelineExecution(_))
    }
}

impl From<HistoryError> for CoordError {
    fn from(err: HistoryError) -> Self {
        if err.is_integrity() {
            Self::HistoryIntegrity(err)
        } else {
            Self::History(err)
        }
    }
}

impl From<PipelineError> for CoordError {
    fn from(err: PipelineError) -> Self {
        if err.is_timeout() {
            Self::PipelineTimeout(err.to_string())
        } else {
            Self::PipelineExecution(err.to_string())
        }
    }
}

/// Result alias for coordinator operations
pub type CoordResult<T> = Result<T, CoordError>;
