//! Manager/Dispatcher for evaluation campaigns
//!
//! The Manager sits between the generator and the workers:
//! - **Send:** the generator hands over rows ready for dispatch
//! - **Receive:** every finished evaluation comes back as one tagged reply
//! - **Stop:** exit criteria and external requests end dispatch with a
//!   `STOP` (or `STOP_AND_DRAIN`) tag on the same reply channel

mod config;
mod core;
mod handle;
mod messages;

use async_trait::async_trait;

use crate::domain::{EvalOutcome, Sample};

pub use config::{ExitCriteria, ManagerConfig};
pub use core::Manager;
pub use handle::{GeneratorLink, ManagerHandle};
pub use messages::{ManagerMetrics, ManagerReply, ManagerRequest, ResultRecord, StopReason, Tag};

/// Evaluates one sample on a worker slot
///
/// Per-sample failures are reported as `EvalOutcome::Failed`, never as a
/// panic or error; the Manager only routes outcomes.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, sample: Sample, worker: u32) -> EvalOutcome;
}
