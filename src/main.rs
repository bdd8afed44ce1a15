use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use birdcast::cleaning::CleaningStep;
use birdcast::config::PipelineConfig;
use birdcast::logging::init_logging;
use birdcast::{io, preprocess, run_forecasts, update_panel, write_outputs, RollingPanel};

#[derive(Parser)]
#[command(name = "birdcast")]
#[command(about = "Weekly bird detection-rate panel and forecasts", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "info,birdcast::worker=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cleaning script and merge the new batch into the panel
    Update {
        /// Merge the batch without running the cleaning script
        #[arg(long)]
        skip_cleaning: bool,
        /// Fail if the cleaning script fails
        #[arg(long)]
        require_fresh_panel: bool,
    },
    /// Forecast every series of the current panel
    Forecast {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Clean, update and forecast
    Run {
        #[arg(long)]
        skip_cleaning: bool,
        /// Abort instead of forecasting from the previous panel when cleaning fails
        #[arg(long)]
        require_fresh_panel: bool,
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

/// Clean, then merge the batch. Returns the panel to forecast from.
fn update_stage(
    config: &PipelineConfig,
    skip_cleaning: bool,
    require_fresh_panel: bool,
) -> anyhow::Result<RollingPanel> {
    let paths = &config.paths;
    let panel = io::read_panel(&paths.panel)
        .with_context(|| format!("failed to read panel {}", paths.panel.display()))?;

    if config.cleaning.enabled && !skip_cleaning {
        let outcome = CleaningStep::from_config(&config.cleaning)
            .run()
            .context("cleaning step could not be started")?;
        if !outcome.is_success() {
            if require_fresh_panel || config.cleaning.require_fresh_panel {
                bail!("cleaning step failed ({:?}); refusing to use a stale panel", outcome);
            }
            warn!(rows = panel.len(), "cleaning failed, keeping the previous panel");
            return Ok(panel);
        }
    }

    let batch = io::read_observations(&paths.batch)
        .with_context(|| format!("failed to read batch {}", paths.batch.display()))?;
    let update = update_panel(&panel, &batch, &config.panel)?;
    if update.changed() {
        io::write_panel(&paths.panel, &update.panel)
            .with_context(|| format!("failed to write panel {}", paths.panel.display()))?;
    }
    Ok(update.panel)
}

fn forecast_stage(config: &PipelineConfig, panel: &RollingPanel) -> anyhow::Result<()> {
    let table = preprocess(panel)?;
    if table.is_empty() {
        bail!("panel {} has no series to forecast", config.paths.panel.display());
    }
    let report = run_forecasts(
        &table,
        &config.search.param_grid,
        &config.worker(),
        &config.driver,
    )?;
    write_outputs(&report, &config.paths).context("failed to write forecast outputs")?;
    info!(
        forecasts = %config.paths.forecasts.display(),
        accuracy = %config.paths.accuracy.display(),
        failed = report.failures.len(),
        "outputs written"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    init_logging(&config.logging, cli.log_level.as_deref())
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to initialise logging")?;

    match cli.command {
        Commands::Update {
            skip_cleaning,
            require_fresh_panel,
        } => {
            update_stage(&config, skip_cleaning, require_fresh_panel)?;
        }
        Commands::Forecast { workers } => {
            if workers.is_some() {
                config.driver.workers = workers;
            }
            let panel = io::read_panel(&config.paths.panel).with_context(|| {
                format!("failed to read panel {}", config.paths.panel.display())
            })?;
            forecast_stage(&config, &panel)?;
        }
        Commands::Run {
            skip_cleaning,
            require_fresh_panel,
            workers,
        } => {
            if workers.is_some() {
                config.driver.workers = workers;
            }
            let panel = update_stage(&config, skip_cleaning, require_fresh_panel)?;
            forecast_stage(&config, &panel)?;
        }
    }
    Ok(())
}
