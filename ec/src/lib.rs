//! evalcoord - Evaluation Coordinator for simulation optimization campaigns
//!
//! Couples a persistent local optimizer to a pool of concurrent workers that
//! evaluate candidate points by running multi-stage chains of external
//! simulation codes.
//!
//! # Core Concepts
//!
//! - **Strict iteration**: the generator proposes one local point, waits for
//!   its result, then proposes again
//! - **Asynchronous delivery**: results come back in any order and land in
//!   the shared history by row id
//! - **Contained failures**: timed-out or failed pipelines become penalty
//!   values, never crashes
//! - **Message contract**: the generator only talks to the Manager through
//!   Send / Receive / Stop
//!
//! # Modules
//!
//! - [`scaler`] - native units <-> unit cube
//! - [`optimizer`] - local optimizer adapter and built-in methods
//! - [`generator`] - the local-search loop and parameter scans
//! - [`manager`] - dispatcher, exit criteria and the message contract
//! - [`pipeline`] - per-sample chains of external steps
//! - [`campaign`] - wiring a configuration into a run
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod campaign;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod generator;
pub mod manager;
pub mod optimizer;
pub mod pipeline;
pub mod scaler;

// Re-export commonly used types
pub use campaign::{BestPoint, Campaign, PreparedRun, RunSummary};
pub use config::{CampaignConfig, CampaignMode, HistoryFormat, OutputConfig};
pub use domain::{EvalOutcome, FailureKind, ParameterSpec, Sample, TaskStatus};
pub use error::{CoordError, CoordResult};
pub use generator::{GenState, GeneratorLoop, ScanConfig, ScanLoop, Terminal};
pub use manager::{
    Evaluator, ExitCriteria, GeneratorLink, Manager, ManagerConfig, ManagerHandle, ManagerMetrics, ManagerReply,
    ResultRecord, StopReason, Tag,
};
pub use optimizer::{LocalOptimizer, OptimizerConfig, Proposal, build_optimizer};
pub use pipeline::{Pipeline, PipelineConfig, PipelineContext, PipelineError, PipelineResult, PipelineRunner};
pub use scaler::ParameterScaler;
