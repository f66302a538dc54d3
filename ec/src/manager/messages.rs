//! Message types for the Manager

use historystore::HistoryRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

use crate::domain::EvalOutcome;

/// Control tag attached to every reply delivered to the generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tag {
    /// Keep going
    Continue,
    /// No more work will be dispatched; finish up now
    Stop,
    /// No more work will be dispatched; in-flight results still follow
    StopAndDrain,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "CONTINUE"),
            Self::Stop => write!(f, "STOP"),
            Self::StopAndDrain => write!(f, "STOP_AND_DRAIN"),
        }
    }
}

/// Why the Manager stopped dispatching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    MaxEvaluations,
    MaxGeneratorCalls,
    Wallclock,
    TargetReached,
    External(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxEvaluations => write!(f, "evaluation budget exhausted"),
            Self::MaxGeneratorCalls => write!(f, "generator call budget exhausted"),
            Self::Wallclock => write!(f, "wall-clock limit reached"),
            Self::TargetReached => write!(f, "target value reached"),
            Self::External(reason) => write!(f, "stop requested: {}", reason),
        }
    }
}

/// One completed evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: u64,
    pub outcome: EvalOutcome,
    pub worker: u32,
    #[serde(rename = "elapsed-ms")]
    pub elapsed_ms: u64,
}

/// Manager -> generator: the `Receive` half of the contract
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerReply {
    pub tag: Tag,
    pub results: Vec<ResultRecord>,
    /// Rows that were queued but will never be dispatched
    pub deferred: Vec<u64>,
    pub reason: Option<StopReason>,
}

impl ManagerReply {
    pub fn proceed(result: ResultRecord) -> Self {
        Self {
            tag: Tag::Continue,
            results: vec![result],
            deferred: Vec::new(),
            reason: None,
        }
    }

    /// True for `Stop` and `StopAndDrain`
    pub fn is_stopping(&self) -> bool {
        self.tag != Tag::Continue
    }
}

/// Requests handled by the Manager task
#[derive(Debug)]
pub enum ManagerRequest {
    /// Rows ready for dispatch
    Send { rows: Vec<HistoryRecord> },

    /// Stop dispatching (signal handler, operator, ...)
    Stop { reason: String },

    /// The generator has finished and will not receive again
    GeneratorDone,

    /// Snapshot of the run counters
    GetMetrics { reply_tx: oneshot::Sender<ManagerMetrics> },
}

/// Run counters reported at shutdown
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerMetrics {
    pub generator_calls: u64,
    pub received: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub penalized: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub halted: u64,
    pub deferred: u64,
    pub aborted: u64,
    pub stop_reason: Option<StopReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_strings() {
        assert_eq!(Tag::Continue.to_string(), "CONTINUE");
        assert_eq!(Tag::StopAndDrain.to_string(), "STOP_AND_DRAIN");
        assert_eq!(serde_json::to_string(&Tag::Stop).unwrap(), "\"STOP\"");
    }

    #[test]
    fn test_reply_is_stopping() {
        let mut reply = ManagerReply {
            tag: Tag::Continue,
            results: vec![],
            deferred: vec![],
            reason: None,
        };
        assert!(!reply.is_stopping());
        reply.tag = Tag::StopAndDrain;
        assert!(reply.is_stopping());
    }
}
