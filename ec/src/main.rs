//! ec - evaluation coordinator
//!
//! CLI entry point for optimization campaigns, parameter scans and history
//! inspection.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use evalcoord::campaign::{Campaign, RunSummary, load_history};
use evalcoord::cli::{Cli, Command, OutputFormat, get_log_path};
use evalcoord::config::{CampaignConfig, CampaignMode};
use evalcoord::manager::ManagerHandle;
use evalcoord::pipeline::{HookRegistry, IdentityConverter, Pipeline};
use historystore::{EvalStatus, HistoryStore};

fn setup_logging(level: tracing::Level) -> Result<()> {
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so its log-level can apply
    let config = CampaignConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let level = match cli.log_level.as_deref() {
        Some(level) => level
            .parse::<tracing::Level>()
            .map_err(|e| eyre::eyre!("Invalid --log-level '{}': {}", level, e))?,
        None => config.log_level()?.unwrap_or(tracing::Level::INFO),
    };
    setup_logging(level).context("Failed to setup logging")?;

    info!(parameters = config.parameters.len(), steps = config.pipeline.steps.len(), "ec loaded config");

    match cli.command {
        Command::Run { output, format } => cmd_campaign(config, CampaignMode::Optimize, output, format).await,
        Command::Scan { output, format } => cmd_campaign(config, CampaignMode::Scan, output, format).await,
        Command::Validate => cmd_validate(&config),
        Command::History { path, format, top } => cmd_history(&path, format, top),
    }
}

/// Run an optimization or scan and print its summary
async fn cmd_campaign(
    mut config: CampaignConfig,
    mode: CampaignMode,
    output: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    if let Some(dir) = output {
        config.output.dir = dir;
    }

    let campaign = Campaign::new(config);
    let prepared = campaign.prepare(mode).context("Invalid campaign configuration")?;
    let run_id = prepared.run_id();
    let handle = prepared.handle();

    if format == OutputFormat::Text {
        println!("Run {} ({}) started. Press Ctrl+C to stop.", run_id, mode);
    }

    let signals = tokio::spawn(stop_on_signal(handle));
    let result = prepared.run().await;
    signals.abort();

    let summary = result?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => print_summary(&summary),
    }
    Ok(())
}

/// Turn SIGINT / SIGTERM into a Manager stop request
async fn stop_on_signal(handle: ManagerHandle) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            let reason = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            warn!("{} received, stopping campaign", reason);
            if handle.stop(reason).await.is_err() {
                debug!("stop_on_signal: manager already finished");
                return Ok(());
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::signal::ctrl_c().await?;
            warn!("Ctrl+C received, stopping campaign");
            if handle.stop("Ctrl+C").await.is_err() {
                return Ok(());
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Run {} {}", summary.run_id, summary.terminal.to_string().bold());
    println!("-----------------");
    println!("Mode:        {}", summary.mode);
    println!("Elapsed:     {:.1}s", summary.elapsed_secs);
    println!(
        "Rows:        {} ({} returned, {} pending, {} penalized)",
        summary.history.rows, summary.history.returned, summary.history.pending, summary.history.penalized
    );
    println!(
        "Dispatched:  {} ({} timeouts, {} failures, {} aborted)",
        summary.metrics.dispatched, summary.metrics.timeouts, summary.metrics.failures, summary.metrics.aborted
    );
    match &summary.best {
        Some(best) => println!("Best:        f = {} at x = {:?} (row {})", best.f, best.x, best.id),
        None => println!("Best:        none"),
    }
    println!("History:     {}", summary.history_path.display());
}

/// Validate the configuration and print what would run
fn cmd_validate(config: &CampaignConfig) -> Result<()> {
    let optimize = config.optimizer.is_some();
    let mode = if optimize { CampaignMode::Optimize } else { CampaignMode::Scan };
    config.validate(mode).context("Configuration is invalid")?;
    let pipeline = Pipeline::from_config(&config.pipeline, &HookRegistry::new(), &IdentityConverter, &config.base_dir)?;

    println!("{} (ready for {})", "Configuration OK".green(), mode);
    println!();
    println!("Parameters:");
    for spec in &config.parameters {
        let periodic = if spec.periodic { " periodic" } else { "" };
        println!(
            "  {:<16} [{}, {}] start {}{}",
            spec.name, spec.lower, spec.upper, spec.start, periodic
        );
    }
    println!();
    println!("Pipeline:");
    for (index, step) in pipeline.steps().iter().enumerate() {
        let timeout = step
            .timeout
            .map(|t| format!("{:?}", t))
            .unwrap_or_else(|| "none".to_string());
        println!(
            "  {:02} {:<12} {:<8} exe={} cores={} timeout={}",
            index,
            step.name,
            step.kind.code(),
            step.executable(),
            step.cores(),
            timeout
        );
        if let Some(hook) = &step.pre_hook {
            println!("       pre-hook:  {}", hook.name());
        }
        if let Some(hook) = &step.post_hook {
            println!("       post-hook: {}", hook.name());
        }
    }
    if let Some(optimizer) = &config.optimizer {
        println!();
        println!("Optimizer: {}", optimizer.method);
    }
    Ok(())
}

/// Print a saved history
fn cmd_history(path: &Path, format: OutputFormat, top: Option<usize>) -> Result<()> {
    let store = load_history(path)?;
    let summary = store.summary();

    let mut rows: Vec<_> = store.iter().collect();
    if let Some(n) = top {
        rows.retain(|r| r.returned && !r.status.is_penalized());
        rows.sort_by(|a, b| a.f().total_cmp(&b.f()));
        rows.truncate(n);
    }

    match format {
        OutputFormat::Json => {
            let records: Vec<_> = rows.iter().map(|r| r.to_record()).collect();
            let json = serde_json::json!({
                "summary": summary,
                "rows": records,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => print_history(&store, &rows, summary.best.map(|(id, _)| id)),
    }
    Ok(())
}

fn print_history(store: &HistoryStore, rows: &[historystore::RecordView<'_>], best: Option<u64>) {
    let header: Vec<String> = (0..store.dim()).map(|i| format!("x{}", i)).collect();
    println!(
        "{:>6}  {:<40} {:>14}  {:<18} {:>5}",
        "id",
        header.join(" "),
        "f",
        "status",
        "local"
    );
    for row in rows {
        let x = row.x.iter().map(|v| format!("{:.6}", v)).collect::<Vec<_>>().join(" ");
        let f = if row.returned { format!("{:.6e}", row.f()) } else { "-".to_string() };
        let line = format!(
            "{:>6}  {:<40} {:>14}  {:<18} {:>5}",
            row.id,
            x,
            f,
            row.status.to_string(),
            if row.is_local_point { "yes" } else { "no" }
        );
        let line = match row.status {
            _ if Some(row.id) == best => line.green().bold(),
            EvalStatus::PenalizedTimeout | EvalStatus::PenalizedFailure => line.red(),
            EvalStatus::Halted => line.yellow(),
            EvalStatus::Pending if row.paused => line.dimmed(),
            _ => line.normal(),
        };
        println!("{}", line);
    }

    let summary = store.summary();
    println!();
    println!(
        "{} rows, {} returned, {} pending, {} penalized",
        summary.rows, summary.returned, summary.pending, summary.penalized
    );
}
