//! Fans the per-series worker out over a bounded thread pool and gathers
//! the results into the output tables.

use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DriverConfig, FailurePolicy, PathsConfig};
use crate::io::write_csv;
use crate::preprocess::{ModelTable, SeriesKey};
use crate::worker::{run_series, AccuracyRecord, ForecastRow, ParamGrid, SeriesForecast, WorkerConfig};
use crate::{BirdcastError, Result};

pub const FORECAST_COLUMNS: [&str; 9] = [
    "ts",
    "actual",
    "forecast",
    "forecast_lower",
    "forecast_upper",
    "county",
    "common_name",
    "week",
    "year",
];
pub const ACCURACY_COLUMNS: [&str; 4] = ["county", "bird_name", "RMSE", "MAE"];
pub const FAILURE_COLUMNS: [&str; 3] = ["common_name", "county", "error"];

/// A series that produced no forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub common_name: String,
    pub county: String,
    pub error: String,
}

/// Aggregated outcome of one forecasting batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub forecasts: Vec<ForecastRow>,
    pub accuracy: Vec<AccuracyRecord>,
    pub failures: Vec<FailureRecord>,
    /// Number of (species, county) units dispatched.
    pub units: usize,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.accuracy.len()
    }
}

/// Every distinct species crossed with every distinct county.
///
/// Combinations that never occur in the table are included; they fail in
/// the worker and land in the failure manifest.
pub fn work_units(table: &ModelTable) -> Vec<SeriesKey> {
    let counties = table.counties();
    table
        .species()
        .into_iter()
        .flat_map(|species| {
            counties
                .iter()
                .map(move |county| SeriesKey::new(species, *county))
        })
        .collect()
}

fn build_pool(workers: Option<usize>) -> Result<rayon::ThreadPool> {
    let mut builder =
        rayon::ThreadPoolBuilder::new().thread_name(|i| format!("birdcast-worker-{}", i));
    if let Some(n) = workers {
        builder = builder.num_threads(n);
    }
    builder
        .build()
        .map_err(|e| BirdcastError::WorkerPool(e.to_string()))
}

/// Forecast every unit of `table` in parallel.
///
/// Results arrive in completion order and are sorted by series before
/// aggregation, so the output does not depend on scheduling.
pub fn run_forecasts(
    table: &ModelTable,
    grid: &ParamGrid,
    config: &WorkerConfig,
    driver: &DriverConfig,
) -> Result<BatchReport> {
    grid.validate()?;
    let start = Instant::now();
    let units = work_units(table);
    let total = units.len();
    let pool = build_pool(driver.workers)?;

    info!(
        units = total,
        species = table.species().len(),
        counties = table.counties().len(),
        workers = pool.current_num_threads(),
        grid_points = grid.combinations().len(),
        "dispatching series"
    );

    let (tx, rx) = mpsc::channel::<(SeriesKey, Result<SeriesForecast>)>();
    let mut outcomes = Vec::with_capacity(total);

    std::thread::scope(|scope| {
        let units = &units;
        let pool = &pool;
        scope.spawn(move || {
            pool.scope(|s| {
                for key in units {
                    let tx = tx.clone();
                    s.spawn(move |_| {
                        let result = run_series(key, table, grid, config);
                        // The receiver lives until every sender is gone
                        let _ = tx.send((key.clone(), result));
                    });
                }
            });
            drop(tx);
        });

        for (key, result) in rx.iter() {
            match &result {
                Ok(f) => debug!(series = %key, rmse = f.accuracy.rmse, "series done"),
                Err(e) => warn!(series = %key, error = %e, "series failed"),
            }
            outcomes.push((key, result));
            if outcomes.len() % 10 == 0 || outcomes.len() == total {
                info!(done = outcomes.len(), total, "progress");
            }
        }
    });

    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let mut report = BatchReport {
        units: total,
        ..Default::default()
    };
    for (key, result) in outcomes {
        match result {
            Ok(forecast) => {
                report.forecasts.extend(forecast.rows);
                report.accuracy.push(forecast.accuracy);
            }
            Err(e) => match driver.failure_policy {
                FailurePolicy::Abort => {
                    return Err(BirdcastError::Series {
                        species: key.common_name,
                        county: key.county,
                        source: Box::new(e),
                    });
                }
                FailurePolicy::Continue => report.failures.push(FailureRecord {
                    common_name: key.common_name,
                    county: key.county,
                    error: e.to_string(),
                }),
            },
        }
    }

    report.elapsed = start.elapsed();
    info!(
        succeeded = report.succeeded(),
        failed = report.failures.len(),
        forecast_rows = report.forecasts.len(),
        elapsed_secs = report.elapsed.as_secs_f64(),
        "forecast batch finished"
    );
    Ok(report)
}

/// Write the forecast, accuracy and failure tables.
pub fn write_outputs(report: &BatchReport, paths: &PathsConfig) -> Result<()> {
    write_report_tables(report, &paths.forecasts, &paths.accuracy, &paths.failures)
}

fn write_report_tables(
    report: &BatchReport,
    forecasts: &Path,
    accuracy: &Path,
    failures: &Path,
) -> Result<()> {
    write_csv(forecasts, &FORECAST_COLUMNS, &report.forecasts)?;
    write_csv(accuracy, &ACCURACY_COLUMNS, &report.accuracy)?;
    write_csv(failures, &FAILURE_COLUMNS, &report.failures)?;
    Ok(())
}
