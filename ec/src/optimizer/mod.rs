//! Local Optimizer Adapter
//!
//! Wraps an arbitrary local-search routine behind one contract:
//! `propose(returned_rows) -> Point | Converged`. The adapter receives the
//! whole returned history on every call so stateful methods can replay it
//! after a restart; the numerical content of the method stays opaque.
//!
//! Methods are constructed once per run by name from a fixed lookup table.

mod external;
mod scripted;

use historystore::RecordView;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::{CoordError, CoordResult};

pub use external::ExternalOptimizer;
pub use scripted::ScriptedOptimizer;

/// What the optimizer wants next
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    /// Evaluate this point (unit-cube coordinates)
    Point(Vec<f64>),
    /// The search has converged; issue no more work
    Converged,
}

/// Errors an optimizer reports when it cannot proceed
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("Malformed feedback: {0}")]
    Malformed(String),

    #[error("Optimizer process failed: {0}")]
    Process(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A local search method driven one point at a time
pub trait LocalOptimizer: Send {
    /// Method name, for logs
    fn name(&self) -> &str;

    /// Propose the next point from the returned rows
    fn propose(&mut self, returned: &[RecordView<'_>]) -> Result<Proposal, OptimizerError>;
}

/// Named method plus its opaque options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub method: String,

    #[serde(default)]
    pub options: serde_json::Value,
}

type Constructor = fn(&serde_json::Value, usize) -> CoordResult<Box<dyn LocalOptimizer>>;

fn scripted(options: &serde_json::Value, dim: usize) -> CoordResult<Box<dyn LocalOptimizer>> {
    let optimizer = ScriptedOptimizer::from_options(options, dim)?;
    Ok(Box::new(optimizer))
}

fn external(options: &serde_json::Value, _dim: usize) -> CoordResult<Box<dyn LocalOptimizer>> {
    let optimizer = ExternalOptimizer::from_options(options)?;
    Ok(Box::new(optimizer))
}

/// Known methods
const METHODS: &[(&str, Constructor)] = &[("scripted", scripted), ("external", external)];

/// Names of every known method
pub fn method_names() -> Vec<&'static str> {
    METHODS.iter().map(|(name, _)| *name).collect()
}

/// Construct the configured method for a `dim`-dimensional problem
pub fn build_optimizer(config: &OptimizerConfig, dim: usize) -> CoordResult<Box<dyn LocalOptimizer>> {
    debug!(method = %config.method, dim, "build_optimizer: called");
    let (_, constructor) = METHODS
        .iter()
        .find(|(name, _)| *name == config.method)
        .ok_or_else(|| {
            CoordError::config(format!(
                "unknown optimizer method '{}' (known: {})",
                config.method,
                method_names().join(", ")
            ))
        })?;
    constructor(&config.options, dim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_method_is_config_error() {
        let config = OptimizerConfig {
            method: "simplex-of-doom".to_string(),
            options: serde_json::Value::Null,
        };
        let err = build_optimizer(&config, 2).err().unwrap();
        assert!(matches!(err, CoordError::Config(_)));
        assert!(err.to_string().contains("scripted"));
    }

    #[test]
    fn test_build_scripted() {
        let config = OptimizerConfig {
            method: "scripted".to_string(),
            options: serde_json::json!({"points": [[0.1, 0.2]]}),
        };
        let optimizer = build_optimizer(&config, 2).unwrap();
        assert_eq!(optimizer.name(), "scripted");
    }

    #[test]
    fn test_build_external_requires_command() {
        let config = OptimizerConfig {
            method: "external".to_string(),
            options: serde_json::json!({}),
        };
        assert!(build_optimizer(&config, 2).is_err());
    }
}
