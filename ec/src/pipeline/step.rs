//! Step kinds and resolved steps

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::config::StepConfig;
use super::context::{Artifact, ArtifactFormat, PipelineContext};
use super::convert::FormatConverter;
use super::hooks::{Hook, HookRegistry};
use super::launcher::LaunchCommand;
use super::{Pipeline, PipelineError};
use crate::error::{CoordError, CoordResult};

/// Simulation code a step runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Elegant,
    Opal,
    Genesis,
    Python,
    User,
}

/// Fixed capabilities of one step kind
struct KindInfo {
    code: &'static str,
    input_file: &'static str,
    serial: Option<&'static str>,
    parallel: Option<&'static str>,
    output: Option<&'static str>,
    format: ArtifactFormat,
}

const KINDS: &[(StepKind, KindInfo)] = &[
    (
        StepKind::Elegant,
        KindInfo {
            code: "elegant",
            input_file: "run.ele",
            serial: Some("elegant"),
            parallel: Some("Pelegant"),
            output: Some("run.out"),
            format: ArtifactFormat::Sdds,
        },
    ),
    (
        StepKind::Opal,
        KindInfo {
            code: "opal",
            input_file: "run.in",
            serial: Some("opal"),
            parallel: Some("opal"),
            output: Some("run.h5"),
            format: ArtifactFormat::Hdf5,
        },
    ),
    (
        StepKind::Genesis,
        KindInfo {
            code: "genesis",
            input_file: "run.in",
            serial: Some("genesis4"),
            parallel: Some("genesis4"),
            output: Some("run.out.h5"),
            format: ArtifactFormat::Genesis,
        },
    ),
    (
        StepKind::Python,
        KindInfo {
            code: "python",
            input_file: "run.py",
            serial: Some("python3"),
            parallel: None,
            output: None,
            format: ArtifactFormat::Text,
        },
    ),
    (
        StepKind::User,
        KindInfo {
            code: "user",
            input_file: "input.txt",
            serial: None,
            parallel: None,
            output: None,
            format: ArtifactFormat::Text,
        },
    ),
];

impl StepKind {
    fn info(self) -> &'static KindInfo {
        // every variant has exactly one row
        &KINDS
            .iter()
            .find(|(kind, _)| *kind == self)
            .unwrap_or(&KINDS[KINDS.len() - 1])
            .1
    }

    /// Look up a configured code name
    pub fn from_code(code: &str) -> CoordResult<Self> {
        KINDS
            .iter()
            .find(|(_, info)| info.code.eq_ignore_ascii_case(code))
            .map(|(kind, _)| *kind)
            .ok_or_else(|| {
                let known: Vec<&str> = KINDS.iter().map(|(_, info)| info.code).collect();
                CoordError::config(format!("unknown step code '{}' (known: {})", code, known.join(", ")))
            })
    }

    pub fn code(self) -> &'static str {
        self.info().code
    }

    pub fn default_input_file(self) -> &'static str {
        self.info().input_file
    }

    /// Format of the artifact this code writes
    pub fn output_format(self) -> ArtifactFormat {
        self.info().format
    }

    fn executable(self, parallel: bool) -> Option<&'static str> {
        let info = self.info();
        if parallel { info.parallel } else { info.serial }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Lifecycle of one step run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    Pending,
    Running,
    Finished,
    KilledTimeout,
    Failed,
}

/// A step resolved against its kind, ready to run
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    template: Option<String>,
    input_file: String,
    executable: String,
    parallel: bool,
    args: Vec<String>,
    cores: u32,
    pub timeout: Option<Duration>,
    output: Option<String>,
    convert_to: Option<ArtifactFormat>,
    pub pre_hook: Option<Arc<dyn Hook>>,
    pub post_hook: Option<Arc<dyn Hook>>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("executable", &self.executable)
            .field("cores", &self.cores)
            .field("timeout", &self.timeout)
            .field("output", &self.output)
            .field("pre_hook", &self.pre_hook.as_ref().map(|h| h.name().to_string()))
            .field("post_hook", &self.post_hook.as_ref().map(|h| h.name().to_string()))
            .finish()
    }
}

impl Step {
    /// Validate a configured step and bind its kind defaults
    pub fn resolve(
        config: &StepConfig,
        registry: &HookRegistry,
        converter: &dyn FormatConverter,
        base_dir: &Path,
    ) -> CoordResult<Self> {
        debug!(name = %config.name, code = %config.code, "Step::resolve: called");
        if config.name.trim().is_empty() || config.name.contains(['/', '\\']) {
            return Err(CoordError::config(format!("invalid step name '{}'", config.name)));
        }
        let kind = StepKind::from_code(&config.code)?;
        let parallel = config.cores > 1;

        let executable = match (&config.executable, kind.executable(parallel)) {
            (Some(exe), _) => exe.clone(),
            (None, Some(exe)) => exe.to_string(),
            (None, None) => {
                return Err(CoordError::config(format!(
                    "step '{}' ({}) needs an explicit executable{}",
                    config.name,
                    kind,
                    if parallel { " for parallel runs" } else { "" }
                )));
            }
        };

        let template = match &config.template {
            Some(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                };
                let source = std::fs::read_to_string(&path).map_err(|e| {
                    CoordError::config(format!(
                        "template for step '{}' ({}): {}",
                        config.name,
                        path.display(),
                        e
                    ))
                })?;
                Some(source)
            }
            None => None,
        };

        let timeout = match config.timeout_secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
            Some(secs) => {
                return Err(CoordError::config(format!(
                    "step '{}' timeout must be positive, got {}",
                    config.name, secs
                )));
            }
            None => None,
        };

        if let Some(to) = config.convert_to
            && !converter.supports(kind.output_format(), to)
        {
            return Err(CoordError::config(format!(
                "step '{}': no conversion from {} to {}",
                config.name,
                kind.output_format(),
                to
            )));
        }

        let pre_hook = config.pre_hook.as_ref().map(|h| registry.resolve(h)).transpose()?;
        let post_hook = config.post_hook.as_ref().map(|h| registry.resolve(h)).transpose()?;

        Ok(Self {
            name: config.name.clone(),
            kind,
            template,
            input_file: config
                .input_file
                .clone()
                .unwrap_or_else(|| kind.default_input_file().to_string()),
            executable,
            parallel,
            args: config.args.clone(),
            cores: config.cores.max(1),
            timeout,
            output: config.output.clone().or_else(|| kind.info().output.map(String::from)),
            convert_to: config.convert_to,
            pre_hook,
            post_hook,
        })
    }

    pub(crate) fn template_source(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    /// Render this step's input file into its directory
    pub fn render_input(&self, pipeline: &Pipeline, ctx: &PipelineContext) -> Result<Option<PathBuf>, PipelineError> {
        if self.template.is_none() {
            return Ok(None);
        }
        let rendered = pipeline
            .templates()
            .render(&self.name, &ctx.template_data())
            .map_err(|e| PipelineError::Render {
                step: self.name.clone(),
                reason: e.to_string(),
            })?;
        let path = ctx.current_dir().join(&self.input_file);
        std::fs::write(&path, rendered).map_err(|source| PipelineError::Io {
            step: self.name.clone(),
            source,
        })?;
        debug!(step = %self.name, ?path, "Step::render_input: written");
        Ok(Some(path))
    }

    /// Build the invocation for this step
    ///
    /// Parallel runs are prefixed with the MPI launcher and the core count.
    pub fn launch_command(
        &self,
        pipeline: &Pipeline,
        ctx: &PipelineContext,
        input: Option<&Path>,
    ) -> Result<LaunchCommand, PipelineError> {
        let data = ctx.template_data();
        let mut argv: Vec<String> = Vec::new();
        if self.parallel {
            argv.extend(pipeline.mpi_command().iter().cloned());
            argv.push(self.cores.to_string());
        }
        argv.push(self.executable.clone());
        if let Some(input) = input
            && let Some(name) = input.file_name()
        {
            argv.push(name.to_string_lossy().into_owned());
        }
        for arg in &self.args {
            let rendered = pipeline
                .templates()
                .render_template(arg, &data)
                .map_err(|e| PipelineError::Render {
                    step: self.name.clone(),
                    reason: format!("argument '{}': {}", arg, e),
                })?;
            argv.push(rendered);
        }

        let dir = ctx.current_dir().to_path_buf();
        let mut argv = argv.into_iter();
        let program = argv.next().unwrap_or_default();
        Ok(LaunchCommand {
            program,
            args: argv.collect(),
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
            cwd: dir,
        })
    }

    /// Collect the step's output artifact and convert it for the next step
    pub fn convert_output(
        &self,
        ctx: &PipelineContext,
        converter: &dyn FormatConverter,
    ) -> Result<Option<Artifact>, PipelineError> {
        let Some(output) = &self.output else {
            return Ok(None);
        };
        let path = ctx.current_dir().join(output);
        if !path.exists() {
            return Err(PipelineError::MissingOutput {
                step: self.name.clone(),
                path,
            });
        }
        let artifact = Artifact {
            path,
            format: self.kind.output_format(),
        };
        match self.convert_to {
            Some(to) if to != artifact.format => converter
                .convert(&artifact, to, ctx.current_dir())
                .map(Some)
                .map_err(|reason| PipelineError::Convert {
                    step: self.name.clone(),
                    reason,
                }),
            _ => Ok(Some(artifact)),
        }
    }
}
