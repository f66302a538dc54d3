//! Evaluation generators
//!
//! - [`GeneratorLoop`] drives one local-search run: seed, then strictly
//!   propose -> wait -> propose until the optimizer converges or the Manager
//!   says stop
//! - [`ScanLoop`] sends a fixed set of points and records every result
//!
//! Both run on a dedicated thread and block only in `GeneratorLink::receive`.

mod engine;
mod sampling;
mod scan;

use historystore::{EvalStatus, Evaluation, HistoryStore, Returned};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::error::CoordResult;
use crate::manager::{GeneratorLink, ResultRecord, StopReason};

pub use engine::{GenState, GeneratorLoop};
pub use sampling::{InitialSamples, ScanConfig, grid_points, random_points};
pub use scan::ScanLoop;

/// How a generator finished
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Terminal {
    /// The optimizer reported convergence
    Converged,
    /// Every scan point returned
    Completed,
    /// The Manager stopped the run
    Stopped { reason: Option<StopReason> },
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::Completed => write!(f, "completed"),
            Self::Stopped { reason: Some(reason) } => write!(f, "stopped ({})", reason),
            Self::Stopped { reason: None } => write!(f, "stopped"),
        }
    }
}

/// Write one delivered result into the history
///
/// Failed samples get `penalty` in every objective slot. A reported value
/// that is non-finite or has the wrong shape is penalized as a failure, so
/// the optimizer only ever sees finite numbers.
pub(crate) fn record_result(history: &mut HistoryStore, penalty: f64, result: ResultRecord) -> CoordResult<()> {
    debug!(id = result.id, worker = result.worker, "record_result: called");
    let shape = history.shape();
    let (value, status) = match result.outcome.value() {
        Some(value) if value.shape() == shape && value.is_finite() => (value.clone(), result.outcome.status()),
        Some(value) => {
            warn!(id = result.id, got = %value.shape(), expected = %shape, "Unusable objective, substituting penalty");
            (Evaluation::filled(shape, penalty), EvalStatus::PenalizedFailure)
        }
        None => {
            warn!(id = result.id, status = %result.outcome.task_status(), "Evaluation failed, substituting penalty");
            (Evaluation::filled(shape, penalty), result.outcome.status())
        }
    };
    history.mark_returned(
        result.id,
        Returned {
            value,
            status,
            worker: Some(result.worker),
        },
    )?;
    Ok(())
}

/// Flag rows the Manager will never dispatch
pub(crate) fn mark_deferred(history: &mut HistoryStore, deferred: &[u64]) -> CoordResult<()> {
    for id in deferred {
        history.set_paused(*id, true)?;
    }
    Ok(())
}

/// Release the Manager and fold in whatever it still had queued
pub(crate) fn release(link: &mut GeneratorLink, history: &mut HistoryStore, penalty: f64) -> CoordResult<()> {
    let leftover = link.finish();
    debug!(replies = leftover.len(), "release: called");
    for reply in leftover {
        for result in reply.results {
            record_result(history, penalty, result)?;
        }
        mark_deferred(history, &reply.deferred)?;
    }
    Ok(())
}
