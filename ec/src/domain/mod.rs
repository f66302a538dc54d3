//! Domain types shared by the generator, manager and pipeline

mod parameter;
mod sample;

pub use parameter::ParameterSpec;
pub use sample::{EvalOutcome, FailureKind, Sample, TaskStatus};
