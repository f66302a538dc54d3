//! Campaign - turn a validated configuration into a running coordinator
//!
//! The generator runs on a blocking thread and the Manager on a tokio task;
//! they talk only through the Manager's message contract. The history is
//! written to `output.dir` whenever the generator returns, including after a
//! fatal error, so partial runs can be inspected.

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use historystore::{HistoryStore, HistorySummary};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CampaignConfig, CampaignMode, HistoryFormat, OutputConfig};
use crate::error::{CoordError, CoordResult};
use crate::generator::{GeneratorLoop, ScanLoop, Terminal};
use crate::manager::{Manager, ManagerHandle, ManagerMetrics};
use crate::optimizer::build_optimizer;
use crate::pipeline::{
    FileObjective, FormatConverter, HookRegistry, IdentityConverter, Launcher, LocalLauncher, Pipeline,
    PipelineEvaluator, PipelineRunner,
};
use crate::scaler::ParameterScaler;

/// Best genuinely evaluated row of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestPoint {
    pub id: u64,
    pub x: Vec<f64>,
    pub f: f64,
}

/// What a finished run reports
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: CampaignMode,
    pub terminal: Terminal,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub history: HistorySummary,
    pub best: Option<BestPoint>,
    pub metrics: ManagerMetrics,
    pub history_path: PathBuf,
}

/// Builds runs from a configuration and its collaborators
pub struct Campaign {
    config: CampaignConfig,
    registry: HookRegistry,
    launcher: Arc<dyn Launcher>,
    converter: Arc<dyn FormatConverter>,
}

impl Campaign {
    pub fn new(config: CampaignConfig) -> Self {
        debug!(parameters = config.parameters.len(), "Campaign::new: called");
        Self {
            config,
            registry: HookRegistry::new(),
            launcher: Arc::new(LocalLauncher),
            converter: Arc::new(IdentityConverter),
        }
    }

    /// Hooks referenced by `named` hook configs
    pub fn with_hooks(mut self, registry: HookRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn FormatConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    /// Validate and assemble everything a run needs, without starting it
    pub fn prepare(&self, mode: CampaignMode) -> CoordResult<PreparedRun> {
        debug!(%mode, "Campaign::prepare: called");
        let config = &self.config;
        config.validate_with(mode, &self.registry)?;

        let scaler = ParameterScaler::new(config.parameters.clone())?;
        let dim = scaler.dim();
        let shape = config.objective.shape()?;
        let run_id = Uuid::now_v7();

        let pipeline = Pipeline::from_config(&config.pipeline, &self.registry, self.converter.as_ref(), &config.base_dir)?;
        let runner = PipelineRunner::new(Arc::new(pipeline), self.launcher.clone(), self.converter.clone());
        let evaluator = PipelineEvaluator::new(
            runner,
            Box::new(FileObjective::from_config(&config.objective)?),
            scaler.names(),
            config.settings.clone(),
            config.pipeline.run_dir.join(run_id.to_string()),
            config.pipeline.keep_run_dirs,
        );

        let mut manager = Manager::new(config.manager.clone(), config.exit.clone(), Arc::new(evaluator));
        let handle = manager.handle();
        let link = manager.connect()?;
        let history = HistoryStore::new(dim, shape);
        let penalty = config.pipeline.penalty;

        let driver = match mode {
            CampaignMode::Optimize => {
                let optimizer_config = config
                    .optimizer
                    .as_ref()
                    .ok_or_else(|| CoordError::config("an optimizer section is required to run an optimization"))?;
                let optimizer = build_optimizer(optimizer_config, dim)?;
                let initial = config.initial_samples.points(dim);
                Driver::Optimize(GeneratorLoop::new(scaler, optimizer, history, link, penalty).with_initial_samples(initial))
            }
            CampaignMode::Scan => {
                let points = config.scan.points(dim)?;
                Driver::Scan(ScanLoop::new(scaler, history, link, penalty, points))
            }
        };

        info!(%run_id, %mode, dim, workers = config.manager.workers, "Campaign prepared");
        Ok(PreparedRun {
            run_id,
            mode,
            manager,
            handle,
            driver,
            output: config.output.clone(),
        })
    }

    /// Prepare and run to completion
    pub async fn run(&self, mode: CampaignMode) -> Result<RunSummary> {
        let prepared = self.prepare(mode).context("Failed to prepare campaign")?;
        prepared.run().await
    }
}

enum Driver {
    Optimize(GeneratorLoop),
    Scan(ScanLoop),
}

impl Driver {
    fn run(&mut self) -> CoordResult<Terminal> {
        match self {
            Self::Optimize(generator) => generator.run(),
            Self::Scan(scan) => scan.run(),
        }
    }

    fn into_history(self) -> HistoryStore {
        match self {
            Self::Optimize(generator) => generator.into_history(),
            Self::Scan(scan) => scan.into_history(),
        }
    }
}

/// A run that is wired up but not started
pub struct PreparedRun {
    run_id: Uuid,
    mode: CampaignMode,
    manager: Manager,
    handle: ManagerHandle,
    driver: Driver,
    output: OutputConfig,
}

impl PreparedRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Handle for requesting a stop while the run is in progress
    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> Result<RunSummary> {
        let PreparedRun {
            run_id,
            mode,
            manager,
            handle,
            driver,
            output,
        } = self;
        drop(handle);

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%run_id, %mode, "Campaign started");

        let manager_task = tokio::spawn(manager.run());
        let (history, outcome) = tokio::task::spawn_blocking(move || {
            let mut driver = driver;
            let outcome = driver.run();
            (driver.into_history(), outcome)
        })
        .await
        .context("Generator thread panicked")?;
        let metrics = manager_task.await.context("Manager task panicked")?;

        let history_path = save_history(&history, &output, run_id)?;
        let terminal = match outcome {
            Ok(terminal) => terminal,
            Err(e) => {
                warn!(%run_id, error = %e, path = %history_path.display(), "Campaign failed");
                return Err(eyre::Report::new(e)
                    .wrap_err(format!("Run {} failed; history saved to {}", run_id, history_path.display())));
            }
        };

        let summary = history.summary();
        let best = summary.best.and_then(|(id, f)| {
            history.get(id).map(|row| BestPoint {
                id,
                x: row.x.to_vec(),
                f,
            })
        });
        info!(%run_id, %terminal, rows = summary.rows, returned = summary.returned, "Campaign finished");

        Ok(RunSummary {
            run_id,
            mode,
            terminal,
            started_at,
            elapsed_secs: clock.elapsed().as_secs_f64(),
            history: summary,
            best,
            metrics,
            history_path,
        })
    }
}

/// Path the history of `run_id` is written to
pub fn history_path(output: &OutputConfig, run_id: Uuid) -> PathBuf {
    output
        .dir
        .join(format!("history-{}.{}", run_id, output.format.extension()))
}

fn save_history(history: &HistoryStore, output: &OutputConfig, run_id: Uuid) -> Result<PathBuf> {
    std::fs::create_dir_all(&output.dir)
        .context(format!("Failed to create output directory {}", output.dir.display()))?;
    let path = history_path(output, run_id);
    match output.format {
        HistoryFormat::Csv => history.save_table(&path),
        HistoryFormat::Jsonl => history.save_jsonl(&path),
    }
    .context(format!("Failed to save history to {}", path.display()))?;
    info!(path = %path.display(), rows = history.count(), "History saved");
    Ok(path)
}

/// Reload a saved history, picking the format from the extension
pub fn load_history(path: &Path) -> Result<HistoryStore> {
    debug!(path = %path.display(), "load_history: called");
    let store = match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") => HistoryStore::load_jsonl(path),
        _ => HistoryStore::load_table(path),
    }
    .context(format!("Failed to load history from {}", path.display()))?;
    Ok(store)
}
