//! Worker-side evaluation: pipeline run plus objective extraction

use async_trait::async_trait;
use historystore::{Evaluation, ObjectiveShape};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::context::PipelineContext;
use super::runner::PipelineRunner;
use super::{PipelineError, PipelineResult};
use crate::domain::{EvalOutcome, FailureKind, Sample};
use crate::error::{CoordError, CoordResult};
use crate::manager::Evaluator;

/// Computes the evaluation from a successful pipeline's final context
pub trait Objective: Send + Sync {
    fn shape(&self) -> ObjectiveShape;

    fn extract(&self, ctx: &PipelineContext) -> Result<Evaluation, PipelineError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectiveMode {
    /// First number in the file
    #[default]
    Scalar,
    /// Exactly `components` numbers, stored as `fvec`
    Vector,
}

/// Where and how to read the objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ObjectiveConfig {
    #[serde(default = "default_objective_file")]
    pub file: String,

    #[serde(default)]
    pub mode: ObjectiveMode,

    /// Residual vector length in `vector` mode
    #[serde(default)]
    pub components: Option<usize>,
}

fn default_objective_file() -> String {
    "objective.txt".to_string()
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            file: default_objective_file(),
            mode: ObjectiveMode::Scalar,
            components: None,
        }
    }
}

impl ObjectiveConfig {
    pub fn shape(&self) -> CoordResult<ObjectiveShape> {
        match (self.mode, self.components) {
            (ObjectiveMode::Scalar, _) => Ok(ObjectiveShape::Scalar),
            (ObjectiveMode::Vector, Some(k)) if k > 0 => Ok(ObjectiveShape::Vector(k)),
            (ObjectiveMode::Vector, _) => Err(CoordError::config(
                "vector objective needs a positive 'components' count",
            )),
        }
    }
}

/// Reads comma or whitespace separated numbers from a file in the last step directory
#[derive(Debug, Clone)]
pub struct FileObjective {
    file: String,
    shape: ObjectiveShape,
}

impl FileObjective {
    pub fn new(file: impl Into<String>, shape: ObjectiveShape) -> Self {
        Self {
            file: file.into(),
            shape,
        }
    }

    pub fn from_config(config: &ObjectiveConfig) -> CoordResult<Self> {
        Ok(Self::new(config.file.clone(), config.shape()?))
    }
}

impl Objective for FileObjective {
    fn shape(&self) -> ObjectiveShape {
        self.shape
    }

    fn extract(&self, ctx: &PipelineContext) -> Result<Evaluation, PipelineError> {
        let path = ctx.current_dir().join(&self.file);
        debug!(?path, shape = %self.shape, "FileObjective::extract: called");
        let text = std::fs::read_to_string(&path)
            .map_err(|e| PipelineError::Objective(format!("cannot read {}: {}", path.display(), e)))?;

        let values = text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                tok.parse::<f64>()
                    .map_err(|_| PipelineError::Objective(format!("'{}' in {} is not a number", tok, path.display())))
            })
            .collect::<Result<Vec<f64>, _>>()?;

        match self.shape {
            ObjectiveShape::Scalar => values
                .first()
                .map(|v| Evaluation::Scalar(*v))
                .ok_or_else(|| PipelineError::Objective(format!("{} is empty", path.display()))),
            ObjectiveShape::Vector(k) if values.len() == k => Ok(Evaluation::Vector(values)),
            ObjectiveShape::Vector(k) => Err(PipelineError::Objective(format!(
                "{} has {} values, expected {}",
                path.display(),
                values.len(),
                k
            ))),
        }
    }
}

/// Removes a sample directory when dropped, including on abort
struct RunDirGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for RunDirGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = ?self.path, error = %e, "Failed to remove run directory");
        }
    }
}

/// Evaluates samples by running the pipeline in a fresh directory per sample
pub struct PipelineEvaluator {
    runner: PipelineRunner,
    objective: Box<dyn Objective>,
    names: Vec<String>,
    settings: BTreeMap<String, serde_json::Value>,
    run_root: PathBuf,
    keep_run_dirs: bool,
}

impl PipelineEvaluator {
    pub fn new(
        runner: PipelineRunner,
        objective: Box<dyn Objective>,
        names: Vec<String>,
        settings: BTreeMap<String, serde_json::Value>,
        run_root: impl Into<PathBuf>,
        keep_run_dirs: bool,
    ) -> Self {
        let run_root = run_root.into();
        debug!(?run_root, keep_run_dirs, "PipelineEvaluator::new: called");
        Self {
            runner,
            objective,
            names,
            settings,
            run_root,
            keep_run_dirs,
        }
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    fn failed(kind: FailureKind, err: &PipelineError) -> EvalOutcome {
        EvalOutcome::Failed {
            kind,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Evaluator for PipelineEvaluator {
    async fn evaluate(&self, sample: Sample, worker: u32) -> EvalOutcome {
        debug!(id = sample.id, worker, "PipelineEvaluator::evaluate: called");
        if sample.x.len() != self.names.len() {
            return EvalOutcome::Failed {
                kind: FailureKind::Execution,
                message: format!("sample has {} coordinates, expected {}", sample.x.len(), self.names.len()),
            };
        }

        let dir = self.run_root.join(format!("sample_{:06}", sample.id));
        if let Err(source) = tokio::fs::create_dir_all(&dir).await {
            let err = PipelineError::Io {
                step: "setup".to_string(),
                source,
            };
            return Self::failed(FailureKind::Execution, &err);
        }
        let _guard = RunDirGuard {
            path: dir.clone(),
            keep: self.keep_run_dirs,
        };

        let params = self.names.iter().cloned().zip(sample.x.iter().copied()).collect();
        let ctx = PipelineContext::new(sample.id, worker, params, self.settings.clone(), dir);

        match self.runner.run(ctx).await {
            PipelineResult::Success(ctx) => match self.objective.extract(&ctx) {
                Ok(value) if value.shape() == self.objective.shape() => EvalOutcome::Evaluated { value },
                Ok(value) => EvalOutcome::Failed {
                    kind: FailureKind::Execution,
                    message: format!("objective has shape {}, expected {}", value.shape(), self.objective.shape()),
                },
                Err(e) => Self::failed(FailureKind::Execution, &e),
            },
            PipelineResult::Halt { payload, code, .. } => EvalOutcome::Halted { value: payload, code },
            PipelineResult::Error(e) => Self::failed(e.kind(), &e),
        }
    }
}
