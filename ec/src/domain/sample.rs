//! Samples dispatched to workers and the outcomes they report

use historystore::{EvalStatus, Evaluation};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point dispatched for evaluation, in native units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: u64,
    pub x: Vec<f64>,
}

/// Why a pipeline did not produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// A step was killed after exceeding its time budget
    Timeout,
    /// Non-zero exit, launch failure, missing output, ...
    Execution,
}

/// Operator-facing status of one evaluation task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    KilledOnTimeout,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::KilledOnTimeout => write!(f, "Worker killed task on Timeout"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// What a worker reports back for one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum EvalOutcome {
    /// Pipeline completed and the objective was extracted
    Evaluated { value: Evaluation },
    /// A hook stopped the chain early with its own payload
    Halted { value: Evaluation, code: i32 },
    /// No usable result; the generator substitutes a penalty
    Failed { kind: FailureKind, message: String },
}

impl EvalOutcome {
    /// Row status this outcome maps to
    pub fn status(&self) -> EvalStatus {
        match self {
            Self::Evaluated { .. } => EvalStatus::Evaluated,
            Self::Halted { .. } => EvalStatus::Halted,
            Self::Failed {
                kind: FailureKind::Timeout,
                ..
            } => EvalStatus::PenalizedTimeout,
            Self::Failed {
                kind: FailureKind::Execution,
                ..
            } => EvalStatus::PenalizedFailure,
        }
    }

    /// Operator-facing status string
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Self::Evaluated { .. } | Self::Halted { .. } => TaskStatus::Completed,
            Self::Failed {
                kind: FailureKind::Timeout,
                ..
            } => TaskStatus::KilledOnTimeout,
            Self::Failed { .. } => TaskStatus::Failed,
        }
    }

    /// The reported value, if the pipeline produced one
    pub fn value(&self) -> Option<&Evaluation> {
        match self {
            Self::Evaluated { value } | Self::Halted { value, .. } => Some(value),
            Self::Failed { .. } => None,
        }
    }
}
