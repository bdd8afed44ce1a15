//! Pipeline configuration, loaded from a JSON file.
//!
//! Every section has defaults, so an empty object (or no file at all) gives
//! the standard weekly run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::diagnostics::CvConfig;
use crate::core::optimizer::OptimizationConfig;
use crate::core::Forecaster;
use crate::logging::LogConfig;
use crate::panel::PanelConfig;
use crate::worker::{ParamGrid, WorkerConfig};
use crate::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub cleaning: CleaningConfig,
    pub panel: PanelConfig,
    pub model: ModelConfig,
    pub search: SearchConfig,
    pub forecast: ForecastConfig,
    pub driver: DriverConfig,
    pub logging: LogConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Settings handed to every per-series job.
    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            model: self.model.clone(),
            search: self.search.clone(),
            forecast: self.forecast,
            trace_fits: self.driver.trace_fits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Persisted rolling panel (Feather or CSV).
    pub panel: PathBuf,
    /// Newly cleaned batch written by the cleaning step.
    pub batch: PathBuf,
    pub forecasts: PathBuf,
    pub accuracy: PathBuf,
    pub failures: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            panel: PathBuf::from("allbirds_detection.feather"),
            batch: PathBuf::from("new_ebd.feather"),
            forecasts: PathBuf::from("110_allbirds_forecasts.csv"),
            accuracy: PathBuf::from("110_allbirds_test_results.csv"),
            failures: PathBuf::from("110_allbirds_failures.csv"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub enabled: bool,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Abort the run instead of forecasting from the previous panel when
    /// cleaning fails.
    pub require_fresh_panel: bool,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "Rscript".to_string(),
            args: vec!["datacleaning_ebd.R".to_string()],
            working_dir: None,
            require_fresh_panel: false,
        }
    }
}

/// Base settings of every fitted model; grid points override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub n_changepoints: usize,
    pub changepoint_range: f64,
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,
    /// Fourier order of the yearly component; 0 disables it.
    pub yearly_order: usize,
    pub interval_width: f64,
    pub optimizer: OptimizationConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_changepoints: 25,
            changepoint_range: 0.8,
            changepoint_prior_scale: 0.05,
            seasonality_prior_scale: 10.0,
            yearly_order: 10,
            interval_width: 0.80,
            optimizer: OptimizationConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn forecaster(&self) -> Result<Forecaster> {
        let model = Forecaster::new()
            .with_changepoints(self.n_changepoints)
            .with_changepoint_range(self.changepoint_range)?
            .with_changepoint_prior_scale(self.changepoint_prior_scale)?
            .with_seasonality_prior_scale(self.seasonality_prior_scale)?
            .with_interval_width(self.interval_width)
            .with_optimizer(self.optimizer);
        Ok(if self.yearly_order == 0 {
            model.without_yearly_seasonality()
        } else {
            model.with_yearly_seasonality(self.yearly_order)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub param_grid: ParamGrid,
    pub horizon_weeks: i64,
    /// Defaults to three horizons.
    pub initial_days: Option<i64>,
    /// Defaults to half a horizon.
    pub period_days: Option<i64>,
    /// Fraction of cross-validation points per metrics window.
    pub rolling_window: f64,
    pub ewm_span: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            param_grid: ParamGrid::default(),
            horizon_weeks: 110,
            initial_days: None,
            period_days: None,
            rolling_window: 0.1,
            ewm_span: 4.0,
        }
    }
}

impl SearchConfig {
    pub fn cv_config(&self) -> CvConfig {
        let mut cv = CvConfig::from_weeks(self.horizon_weeks);
        if let Some(days) = self.initial_days {
            cv = cv.with_initial_days(days);
        }
        if let Some(days) = self.period_days {
            cv = cv.with_period_days(days);
        }
        cv
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Weekly periods forecast past the last history date.
    pub periods: usize,
    /// Last year kept in the output; defaults to the last history year + 2.
    pub max_year: Option<i32>,
    /// Year whose trailing week-52 rows without an actual are dropped;
    /// defaults to the last history year.
    pub partial_year: Option<i32>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            periods: 110,
            max_year: None,
            partial_year: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record failed series in the failure manifest and keep going.
    #[default]
    Continue,
    /// Fail the batch if any series failed.
    Abort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Worker threads; defaults to the number of logical CPUs.
    pub workers: Option<usize>,
    pub failure_policy: FailurePolicy,
    pub trace_fits: bool,
}
