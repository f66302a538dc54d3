//! Pipeline Runner - one sample through an ordered chain of external steps
//!
//! Each step may run a pre-hook, renders its input from a template, launches
//! its executable through the [`Launcher`], converts its output into the
//! canonical format for the next step and may run a post-hook. Any hook can
//! halt the chain early with its own payload; a failed or timed-out step
//! ends the chain with an error.

mod config;
mod context;
mod convert;
mod evaluator;
mod hooks;
mod launcher;
mod runner;
mod step;

use handlebars::Handlebars;
use historystore::Evaluation;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::FailureKind;
use crate::error::{CoordError, CoordResult};

pub use config::{PipelineConfig, StepConfig};
pub use context::{Artifact, ArtifactFormat, PipelineContext, StepRecord};
pub use convert::{FormatConverter, IdentityConverter};
pub use evaluator::{FileObjective, Objective, ObjectiveConfig, ObjectiveMode, PipelineEvaluator};
pub use hooks::{CopySetting, HaltIfExists, Hook, HookConfig, HookOutcome, HookRegistry};
pub use launcher::{LaunchCommand, LaunchError, Launcher, LocalLauncher, PollStatus, ProcessHandle};
pub use runner::PipelineRunner;
pub use step::{Step, StepKind, StepState};

/// Why one sample's pipeline produced no result
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("step '{step}' killed after exceeding its {timeout:?} timeout")]
    Timeout { step: String, timeout: Duration },

    #[error("step '{step}' exited with code {code}")]
    Exit { step: String, code: i32 },

    #[error("step '{step}' was killed by a signal")]
    Killed { step: String },

    #[error("step '{step}' could not be launched: {source}")]
    Launch {
        step: String,
        #[source]
        source: LaunchError,
    },

    #[error("step '{step}' input could not be rendered: {reason}")]
    Render { step: String, reason: String },

    #[error("step '{step}' output could not be converted: {reason}")]
    Convert { step: String, reason: String },

    #[error("step '{step}' did not produce {path}")]
    MissingOutput { step: String, path: PathBuf },

    #[error("hook '{hook}' on step '{step}' failed: {reason}")]
    Hook { step: String, hook: String, reason: String },

    #[error("objective extraction failed: {0}")]
    Objective(String),

    #[error("I/O error in '{step}': {source}")]
    Io {
        step: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Failure class used for the row status
    pub fn kind(&self) -> FailureKind {
        if self.is_timeout() {
            FailureKind::Timeout
        } else {
            FailureKind::Execution
        }
    }

    /// Step the error happened in, if any
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Timeout { step, .. }
            | Self::Exit { step, .. }
            | Self::Killed { step }
            | Self::Launch { step, .. }
            | Self::Render { step, .. }
            | Self::Convert { step, .. }
            | Self::MissingOutput { step, .. }
            | Self::Hook { step, .. }
            | Self::Io { step, .. } => Some(step),
            Self::Objective(_) => None,
        }
    }
}

/// Outcome of one pipeline run
#[derive(Debug)]
pub enum PipelineResult {
    /// Every step completed
    Success(PipelineContext),
    /// A hook stopped the chain early with this payload
    Halt {
        payload: Evaluation,
        code: i32,
        context: PipelineContext,
    },
    /// A step failed or timed out
    Error(PipelineError),
}

/// An immutable, validated chain of steps
pub struct Pipeline {
    steps: Vec<Step>,
    templates: Handlebars<'static>,
    poll_interval: Duration,
    mpi_command: Vec<String>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps)
            .field("poll_interval", &self.poll_interval)
            .field("mpi_command", &self.mpi_command)
            .finish()
    }
}

impl Pipeline {
    /// Resolve and validate every step before any dispatch
    ///
    /// Relative template paths resolve against `base_dir`.
    pub fn from_config(
        config: &PipelineConfig,
        registry: &HookRegistry,
        converter: &dyn FormatConverter,
        base_dir: &Path,
    ) -> CoordResult<Self> {
        debug!(steps = config.steps.len(), ?base_dir, "Pipeline::from_config: called");
        if config.steps.is_empty() {
            return Err(CoordError::config("pipeline needs at least one step"));
        }
        if !config.penalty.is_finite() {
            return Err(CoordError::config("pipeline penalty must be finite"));
        }
        if config.poll_interval_ms == 0 {
            return Err(CoordError::config("pipeline poll-interval-ms must be positive"));
        }
        if config.mpi_command.is_empty() {
            return Err(CoordError::config("pipeline mpi-command must not be empty"));
        }

        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        templates.set_strict_mode(true);

        let mut names = HashSet::new();
        let mut steps = Vec::with_capacity(config.steps.len());
        for step_config in &config.steps {
            if !names.insert(step_config.name.as_str()) {
                return Err(CoordError::config(format!("duplicate step name '{}'", step_config.name)));
            }
            let step = Step::resolve(step_config, registry, converter, base_dir)?;
            if let Some(source) = step.template_source() {
                templates
                    .register_template_string(&step.name, source)
                    .map_err(|e| CoordError::config(format!("template for step '{}': {}", step.name, e)))?;
            }
            steps.push(step);
        }

        info!(steps = steps.len(), "Pipeline built");
        Ok(Self {
            steps,
            templates,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            mpi_command: config.mpi_command.clone(),
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn templates(&self) -> &Handlebars<'static> {
        &self.templates
    }

    pub(crate) fn mpi_command(&self) -> &[String] {
        &self.mpi_command
    }
}
