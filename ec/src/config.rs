//! Campaign configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::domain::ParameterSpec;
use crate::error::{CoordError, CoordResult};
use crate::generator::{InitialSamples, ScanConfig};
use crate::manager::{ExitCriteria, ManagerConfig};
use crate::optimizer::{OptimizerConfig, build_optimizer};
use crate::pipeline::{HookRegistry, IdentityConverter, ObjectiveConfig, Pipeline, PipelineConfig};
use crate::scaler::ParameterScaler;

/// What a campaign does with its parameter space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CampaignMode {
    /// Persistent local optimization from the start point
    Optimize,
    /// Evaluate a fixed grid or random point set
    Scan,
}

impl std::fmt::Display for CampaignMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Optimize => write!(f, "optimize"),
            Self::Scan => write!(f, "scan"),
        }
    }
}

/// Main campaign configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CampaignConfig {
    /// Optimized parameters, in positional order
    pub parameters: Vec<ParameterSpec>,

    /// Fixed values visible to templates and hooks
    pub settings: BTreeMap<String, serde_json::Value>,

    pub pipeline: PipelineConfig,

    pub objective: ObjectiveConfig,

    /// Global exit criteria
    pub exit: ExitCriteria,

    pub manager: ManagerConfig,

    /// Local optimizer; required for `run`
    pub optimizer: Option<OptimizerConfig>,

    /// Point set for `scan`
    pub scan: ScanConfig,

    pub initial_samples: InitialSamples,

    pub output: OutputConfig,

    /// trace, debug, info, warn or error
    pub log_level: Option<String>,

    /// Directory relative template paths resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl CampaignConfig {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .evalcoord.yml
        let local_config = PathBuf::from(".evalcoord.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/evalcoord/evalcoord.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("evalcoord").join("evalcoord.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self {
            base_dir: PathBuf::from("."),
            ..Self::default()
        })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let mut config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.base_dir = path
            .as_ref()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Parsed `log-level`, if set
    pub fn log_level(&self) -> Result<Option<tracing::Level>> {
        self.log_level
            .as_deref()
            .map(|level| tracing::Level::from_str(level).map_err(|e| eyre::eyre!("Invalid log-level '{}': {}", level, e)))
            .transpose()
    }

    /// Fail fast on anything that would break a run in `mode`
    pub fn validate(&self, mode: CampaignMode) -> CoordResult<()> {
        self.validate_with(mode, &HookRegistry::new())
    }

    /// Same as [`validate`](Self::validate), resolving `named` hooks in `registry`
    pub fn validate_with(&self, mode: CampaignMode, registry: &HookRegistry) -> CoordResult<()> {
        debug!(%mode, parameters = self.parameters.len(), "CampaignConfig::validate: called");
        let scaler = ParameterScaler::new(self.parameters.clone())?;

        if self.manager.workers == 0 {
            return Err(CoordError::config("manager.workers must be at least 1"));
        }
        if self.manager.channel_buffer == 0 {
            return Err(CoordError::config("manager.channel-buffer must be at least 1"));
        }
        if let Some(seconds) = self.exit.max_wallclock_seconds
            && !(seconds.is_finite() && seconds >= 0.0)
        {
            return Err(CoordError::config("exit.max-wallclock-seconds must be a non-negative number"));
        }
        if let Some(level) = &self.log_level
            && tracing::Level::from_str(level).is_err()
        {
            return Err(CoordError::config(format!("unknown log-level '{}'", level)));
        }

        self.objective.shape()?;
        Pipeline::from_config(&self.pipeline, registry, &IdentityConverter, &self.base_dir)?;

        match mode {
            CampaignMode::Optimize => {
                let optimizer = self
                    .optimizer
                    .as_ref()
                    .ok_or_else(|| CoordError::config("an optimizer section is required to run an optimization"))?;
                build_optimizer(optimizer, scaler.dim())?;
            }
            CampaignMode::Scan => {
                self.scan.points(scaler.dim())?;
            }
        }
        Ok(())
    }
}

/// On-disk history format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryFormat {
    #[default]
    Csv,
    Jsonl,
}

impl HistoryFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Jsonl => "jsonl",
        }
    }
}

/// Where the history is written after a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub format: HistoryFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            format: HistoryFormat::Csv,
        }
    }
}
