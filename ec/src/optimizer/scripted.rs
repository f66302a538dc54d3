//! scripted - replay a fixed list of points, then converge

use historystore::RecordView;
use std::collections::VecDeque;
use tracing::debug;

use super::{LocalOptimizer, OptimizerError, Proposal};
use crate::error::{CoordError, CoordResult};

/// Proposes a predetermined sequence of unit-cube points
///
/// Useful for replaying a recorded trajectory and for exercising the
/// coordinator without a real search method.
#[derive(Debug, Clone)]
pub struct ScriptedOptimizer {
    points: VecDeque<Vec<f64>>,
    proposed: usize,
}

impl ScriptedOptimizer {
    pub fn new(points: Vec<Vec<f64>>) -> Self {
        debug!(count = points.len(), "ScriptedOptimizer::new: called");
        Self {
            points: points.into(),
            proposed: 0,
        }
    }

    /// Build from `{"points": [[...], ...]}`
    pub fn from_options(options: &serde_json::Value, dim: usize) -> CoordResult<Self> {
        debug!(%options, dim, "ScriptedOptimizer::from_options: called");
        let points: Vec<Vec<f64>> = serde_json::from_value(options["points"].clone())
            .map_err(|e| CoordError::config(format!("scripted optimizer needs 'points': {}", e)))?;
        if let Some(bad) = points.iter().find(|p| p.len() != dim) {
            return Err(CoordError::config(format!(
                "scripted point has {} coordinates, expected {}",
                bad.len(),
                dim
            )));
        }
        Ok(Self::new(points))
    }

    /// Number of points handed out so far
    pub fn proposed(&self) -> usize {
        self.proposed
    }
}

impl LocalOptimizer for ScriptedOptimizer {
    fn name(&self) -> &str {
        "scripted"
    }

    fn propose(&mut self, returned: &[RecordView<'_>]) -> Result<Proposal, OptimizerError> {
        debug!(returned = returned.len(), remaining = self.points.len(), "ScriptedOptimizer::propose: called");
        match self.points.pop_front() {
            Some(point) => {
                self.proposed += 1;
                Ok(Proposal::Point(point))
            }
            None => {
                debug!("ScriptedOptimizer::propose: script exhausted, converged");
                Ok(Proposal::Converged)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replays_then_converges() {
        let mut optimizer = ScriptedOptimizer::new(vec![vec![0.1], vec![0.2]]);
        assert_eq!(optimizer.propose(&[]).unwrap(), Proposal::Point(vec![0.1]));
        assert_eq!(optimizer.propose(&[]).unwrap(), Proposal::Point(vec![0.2]));
        assert_eq!(optimizer.propose(&[]).unwrap(), Proposal::Converged);
        assert_eq!(optimizer.proposed(), 2);
    }

    #[test]
    fn test_from_options_checks_dimension() {
        let options = serde_json::json!({"points": [[0.1, 0.2], [0.3]]});
        assert!(ScriptedOptimizer::from_options(&options, 2).is_err());

        let options = serde_json::json!({"points": [[0.1, 0.2]]});
        assert!(ScriptedOptimizer::from_options(&options, 2).is_ok());
    }

    #[test]
    fn test_from_options_requires_points() {
        assert!(ScriptedOptimizer::from_options(&serde_json::json!({}), 1).is_err());
    }
}
