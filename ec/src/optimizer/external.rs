//! external - delegate proposals to an external search program
//!
//! Protocol, one process per proposal:
//! - stdin: `{"dim": n, "history": [{"id", "x-cube", "f", "fvec"?, "status", "is-local-point"}]}`
//! - stdout: `{"x": [...]}` (unit cube) or `{"converged": true}`

use std::io::Write;
use std::process::{Command, Stdio};

use historystore::{Evaluation, RecordView};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{LocalOptimizer, OptimizerError, Proposal};
use crate::error::{CoordError, CoordResult};

#[derive(Debug, Serialize)]
struct HistoryRow {
    id: u64,
    #[serde(rename = "x-cube")]
    x_cube: Vec<f64>,
    f: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    fvec: Option<Vec<f64>>,
    status: String,
    #[serde(rename = "is-local-point")]
    is_local_point: bool,
}

#[derive(Debug, Serialize)]
struct ProposeRequest {
    dim: usize,
    history: Vec<HistoryRow>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProposeReply {
    Point { x: Vec<f64> },
    Converged { converged: bool },
}

#[derive(Debug, Deserialize)]
struct ExternalOptions {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Runs an external program for every proposal
#[derive(Debug, Clone)]
pub struct ExternalOptimizer {
    command: String,
    args: Vec<String>,
    calls: u64,
}

impl ExternalOptimizer {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            calls: 0,
        }
    }

    /// Build from `{"command": "...", "args": [...]}`
    pub fn from_options(options: &serde_json::Value) -> CoordResult<Self> {
        debug!(%options, "ExternalOptimizer::from_options: called");
        let parsed: ExternalOptions = serde_json::from_value(options.clone())
            .map_err(|e| CoordError::config(format!("external optimizer options: {}", e)))?;
        if parsed.command.trim().is_empty() {
            return Err(CoordError::config("external optimizer 'command' must not be empty"));
        }
        Ok(Self::new(parsed.command, parsed.args))
    }

    /// Number of times the program has been run
    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn request(returned: &[RecordView<'_>]) -> ProposeRequest {
        let dim = returned.first().map(|r| r.x_cube.len()).unwrap_or(0);
        let history = returned
            .iter()
            .map(|row| {
                let value = row.value();
                let f = value.as_ref().map(Evaluation::scalar).unwrap_or(f64::NAN);
                let fvec = match value {
                    Some(Evaluation::Vector(values)) => Some(values),
                    _ => None,
                };
                HistoryRow {
                    id: row.id,
                    x_cube: row.x_cube.to_vec(),
                    f,
                    fvec,
                    status: row.status.to_string(),
                    is_local_point: row.is_local_point,
                }
            })
            .collect();
        ProposeRequest { dim, history }
    }
}

impl LocalOptimizer for ExternalOptimizer {
    fn name(&self) -> &str {
        "external"
    }

    fn propose(&mut self, returned: &[RecordView<'_>]) -> Result<Proposal, OptimizerError> {
        debug!(command = %self.command, returned = returned.len(), "ExternalOptimizer::propose: called");
        self.calls += 1;
        let payload = serde_json::to_vec(&Self::request(returned))
            .map_err(|e| OptimizerError::Malformed(format!("cannot encode history: {}", e)))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload)?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(command = %self.command, code = ?output.status.code(), "External optimizer failed");
            return Err(OptimizerError::Process(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match serde_json::from_str::<ProposeReply>(stdout.trim()) {
            Ok(ProposeReply::Point { x }) => {
                debug!(?x, "ExternalOptimizer::propose: point");
                Ok(Proposal::Point(x))
            }
            Ok(ProposeReply::Converged { converged: true }) => {
                debug!("ExternalOptimizer::propose: converged");
                Ok(Proposal::Converged)
            }
            Ok(ProposeReply::Converged { converged: false }) => {
                Err(OptimizerError::Malformed("reply has converged=false and no point".to_string()))
            }
            Err(e) => Err(OptimizerError::Malformed(format!("unparsable reply '{}': {}", stdout.trim(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use historystore::{EvalStatus, HistoryStore, NewRow, ObjectiveShape, Returned};

    fn shell(script: &str) -> ExternalOptimizer {
        ExternalOptimizer::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_point_reply() {
        let mut optimizer = shell(r#"cat > /dev/null; echo '{"x": [0.25, 0.75]}'"#);
        assert_eq!(optimizer.propose(&[]).unwrap(), Proposal::Point(vec![0.25, 0.75]));
    }

    #[test]
    fn test_converged_reply() {
        let mut optimizer = shell(r#"cat > /dev/null; echo '{"converged": true}'"#);
        assert_eq!(optimizer.propose(&[]).unwrap(), Proposal::Converged);
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        let mut optimizer = shell("cat > /dev/null; echo boom >&2; exit 3");
        let err = optimizer.propose(&[]).unwrap_err();
        assert!(matches!(err, OptimizerError::Process(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_garbage_reply_is_malformed() {
        let mut optimizer = shell("cat > /dev/null; echo not-json");
        assert!(matches!(optimizer.propose(&[]), Err(OptimizerError::Malformed(_))));
    }

    #[test]
    fn test_history_is_sent_on_stdin() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        let id = store
            .append(NewRow {
                x: &[2.0],
                x_cube: &[0.5],
                is_local_point: false,
                paused: false,
            })
            .unwrap();
        store
            .mark_returned(
                id,
                Returned {
                    value: Evaluation::Scalar(3.5),
                    status: EvalStatus::Evaluated,
                    worker: None,
                },
            )
            .unwrap();

        // Echo the point back only if the history reached the program
        let mut optimizer = shell(r#"grep -q '"f":3.5' && echo '{"x": [0.5]}' || echo '{"converged": false}'"#);
        let returned = store.returned();
        assert_eq!(optimizer.propose(&returned).unwrap(), Proposal::Point(vec![0.5]));
    }

    fn single_row(shape: ObjectiveShape, value: Evaluation) -> HistoryStore {
        let mut store = HistoryStore::new(1, shape);
        let id = store
            .append(NewRow {
                x: &[1.0],
                x_cube: &[0.5],
                is_local_point: true,
                paused: false,
            })
            .unwrap();
        store
            .mark_returned(
                id,
                Returned {
                    value,
                    status: EvalStatus::Evaluated,
                    worker: None,
                },
            )
            .unwrap();
        store
    }

    #[test]
    fn test_single_component_vector_sends_fvec() {
        let store = single_row(ObjectiveShape::Vector(1), Evaluation::Vector(vec![-2.0]));
        let request = ExternalOptimizer::request(&store.returned());
        assert_eq!(request.history[0].fvec, Some(vec![-2.0]));
        assert_eq!(request.history[0].f, 4.0);

        let store = single_row(ObjectiveShape::Scalar, Evaluation::Scalar(-2.0));
        let request = ExternalOptimizer::request(&store.returned());
        assert_eq!(request.history[0].fvec, None);
        assert_eq!(request.history[0].f, -2.0);
    }
}
