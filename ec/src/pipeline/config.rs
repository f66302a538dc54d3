//! Pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use super::context::ArtifactFormat;
use super::hooks::HookConfig;

/// One configured step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepConfig {
    /// Unique step name, also used for the step directory
    pub name: String,

    /// Simulation code: elegant, opal, genesis, python or user
    pub code: String,

    /// Input template file (handlebars)
    #[serde(default)]
    pub template: Option<PathBuf>,

    /// Name of the rendered input file; defaults per code
    #[serde(default)]
    pub input_file: Option<String>,

    /// Executable override; required for `user` steps
    #[serde(default)]
    pub executable: Option<String>,

    /// Extra arguments, rendered as templates
    #[serde(default)]
    pub args: Vec<String>,

    /// Cores per run; more than one selects the parallel executable
    #[serde(default = "default_cores")]
    pub cores: u32,

    /// Wall-clock budget for this step
    #[serde(default)]
    pub timeout_secs: Option<f64>,

    /// Expected output artifact; defaults per code
    #[serde(default)]
    pub output: Option<String>,

    /// Canonical format to convert the output into for the next step
    #[serde(default)]
    pub convert_to: Option<ArtifactFormat>,

    #[serde(default)]
    pub pre_hook: Option<HookConfig>,

    #[serde(default)]
    pub post_hook: Option<HookConfig>,
}

fn default_cores() -> u32 {
    1
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            code: String::new(),
            template: None,
            input_file: None,
            executable: None,
            args: Vec::new(),
            cores: default_cores(),
            timeout_secs: None,
            output: None,
            convert_to: None,
            pre_hook: None,
            post_hook: None,
        }
    }
}

/// Pipeline-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineConfig {
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Objective written for timed-out or failed samples
    #[serde(default = "default_penalty")]
    pub penalty: f64,

    /// How often running steps are polled
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Root for per-sample working directories
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Keep per-sample directories after the pipeline finishes
    #[serde(default)]
    pub keep_run_dirs: bool,

    /// Prefix for parallel invocations; the core count is appended
    #[serde(default = "default_mpi_command")]
    pub mpi_command: Vec<String>,
}

fn default_penalty() -> f64 {
    debug!("default_penalty: called");
    1.0e12
}

fn default_poll_interval_ms() -> u64 {
    debug!("default_poll_interval_ms: called");
    100
}

fn default_run_dir() -> PathBuf {
    debug!("default_run_dir: called");
    PathBuf::from("runs")
}

fn default_mpi_command() -> Vec<String> {
    debug!("default_mpi_command: called");
    vec!["mpirun".to_string(), "-n".to_string()]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        debug!("PipelineConfig::default: called");
        Self {
            steps: Vec::new(),
            penalty: default_penalty(),
            poll_interval_ms: default_poll_interval_ms(),
            run_dir: default_run_dir(),
            keep_run_dirs: false,
            mpi_command: default_mpi_command(),
        }
    }
}
