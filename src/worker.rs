//! Per-series hyperparameter search and forecast.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::{ForecastConfig, ModelConfig, SearchConfig};
use crate::core::diagnostics::{cross_validation, performance_metrics};
use crate::core::{dt_to_week_number, Forecaster, Frequency, TimeSeriesData};
use crate::preprocess::{ModelTable, SeriesKey, CAP, FLOOR};
use crate::{BirdcastError, Result};

/// Hyperparameters the grid search may vary.
pub const GRID_PARAMETERS: [&str; 4] = [
    "changepoint_prior_scale",
    "seasonality_prior_scale",
    "changepoint_range",
    "n_changepoints",
];

/// One point of the grid: parameter name to value.
pub type ParamSet = BTreeMap<String, f64>;

/// Named dimensions searched as a Cartesian product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamGrid(BTreeMap<String, Vec<f64>>);

impl Default for ParamGrid {
    fn default() -> Self {
        let mut dims = BTreeMap::new();
        dims.insert(
            "changepoint_prior_scale".to_string(),
            vec![0.1, 0.5, 1.0, 5.0],
        );
        Self(dims)
    }
}

impl ParamGrid {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_dimension(mut self, name: &str, values: Vec<f64>) -> Self {
        self.0.insert(name.to_string(), values);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = self.0.keys().find(|k| !GRID_PARAMETERS.contains(&k.as_str())) {
            return Err(BirdcastError::DataValidation(format!(
                "unknown grid parameter '{}', expected one of {:?}",
                name, GRID_PARAMETERS
            )));
        }
        if let Some((name, _)) = self.0.iter().find(|(_, v)| v.is_empty()) {
            return Err(BirdcastError::DataValidation(format!(
                "grid parameter '{}' has no values",
                name
            )));
        }
        Ok(())
    }

    /// Every combination, last dimension (by name) varying fastest.
    pub fn combinations(&self) -> Vec<ParamSet> {
        let mut out = vec![ParamSet::new()];
        for (name, values) in &self.0 {
            out = out
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |v| {
                        let mut p = prefix.clone();
                        p.insert(name.clone(), *v);
                        p
                    })
                })
                .collect();
        }
        out
    }
}

/// Settings shared by every per-series job.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub model: ModelConfig,
    pub search: SearchConfig,
    pub forecast: ForecastConfig,
    /// Emit a debug event for every grid point and the chosen model's parameters.
    pub trace_fits: bool,
}

/// Date-ordered series ready for smoothing and fitting.
#[derive(Debug, Clone)]
pub struct SeriesFrame {
    pub key: SeriesKey,
    pub ds: Vec<NaiveDate>,
    /// Smoothed target; NaN before the first observation.
    pub y: Vec<f64>,
    /// Target before smoothing.
    pub actual: Vec<Option<f64>>,
}

impl SeriesFrame {
    pub fn select(table: &ModelTable, key: &SeriesKey, ewm_span: f64) -> Result<Self> {
        let rows = table
            .series(key)
            .filter(|rows| !rows.is_empty())
            .ok_or_else(|| {
                BirdcastError::DataValidation(format!("no rows for series {}", key))
            })?;
        let actual: Vec<Option<f64>> = rows.iter().map(|r| r.y).collect();
        let y = ewm_mean(&actual, ewm_span)
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Ok(Self {
            key: key.clone(),
            ds: rows.iter().map(|r| r.ds).collect(),
            y,
            actual,
        })
    }

    pub fn to_series(&self) -> Result<TimeSeriesData> {
        let n = self.ds.len();
        TimeSeriesData::new(
            self.ds.clone(),
            self.y.clone(),
            Some(vec![CAP; n]),
            Some(vec![FLOOR; n]),
        )
    }
}

/// Exponentially weighted mean with span `span`, bias-adjusted.
///
/// Weights decay by position, including over missing values. A missing input
/// yields the running mean of everything before it; positions before the
/// first observation stay missing.
pub fn ewm_mean(values: &[Option<f64>], span: f64) -> Vec<Option<f64>> {
    let alpha = 2.0 / (span + 1.0);
    let decay = 1.0 - alpha;
    let mut num = 0.0;
    let mut den = 0.0;
    values
        .iter()
        .map(|v| {
            num *= decay;
            den *= decay;
            if let Some(x) = (*v).filter(|x| x.is_finite()) {
                num += x;
                den += 1.0;
            }
            if den > 0.0 {
                Some(num / den)
            } else {
                None
            }
        })
        .collect()
}

/// Index of the smallest score; ties keep the earliest, NaN never wins
/// against a number.
pub fn select_best(scores: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &s) in scores.iter().enumerate() {
        match best {
            None => best = Some(i),
            Some(b) => {
                let current = scores[b];
                if (current.is_nan() && !s.is_nan()) || s < current {
                    best = Some(i);
                }
            }
        }
    }
    best
}

/// Cross-validated score of one grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridScore {
    pub params: ParamSet,
    pub rmse: f64,
    pub mae: f64,
}

/// One output row of the forecast table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    #[serde(rename = "ts")]
    pub ds: NaiveDate,
    pub actual: Option<f64>,
    #[serde(rename = "forecast")]
    pub yhat: f64,
    #[serde(rename = "forecast_lower")]
    pub yhat_lower: f64,
    #[serde(rename = "forecast_upper")]
    pub yhat_upper: f64,
    pub county: String,
    pub common_name: String,
    pub week: u32,
    pub year: i32,
}

/// Best cross-validated accuracy of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyRecord {
    pub county: String,
    #[serde(rename = "bird_name")]
    pub common_name: String,
    #[serde(rename = "RMSE")]
    pub rmse: f64,
    #[serde(rename = "MAE")]
    pub mae: f64,
}

#[derive(Debug, Clone)]
pub struct SeriesForecast {
    pub key: SeriesKey,
    pub rows: Vec<ForecastRow>,
    pub accuracy: AccuracyRecord,
    pub best_params: ParamSet,
    pub grid: Vec<GridScore>,
}

fn build_model(base: &ModelConfig, params: &ParamSet) -> Result<Forecaster> {
    let mut model = base.forecaster()?;
    for (name, &value) in params {
        model = match name.as_str() {
            "changepoint_prior_scale" => model.with_changepoint_prior_scale(value)?,
            "seasonality_prior_scale" => model.with_seasonality_prior_scale(value)?,
            "changepoint_range" => model.with_changepoint_range(value)?,
            "n_changepoints" => {
                if !(value >= 0.0 && value.fract() == 0.0) {
                    return Err(BirdcastError::DataValidation(format!(
                        "n_changepoints must be a non-negative integer, got {}",
                        value
                    )));
                }
                model.with_changepoints(value as usize)
            }
            other => {
                return Err(BirdcastError::DataValidation(format!(
                    "unknown grid parameter '{}'",
                    other
                )))
            }
        };
    }
    Ok(model)
}

fn score_params(
    base: &ModelConfig,
    params: &ParamSet,
    data: &TimeSeriesData,
    search: &SearchConfig,
) -> Result<GridScore> {
    let template = build_model(base, params)?;
    let mut rows = cross_validation(&template, data, &search.cv_config())?;
    for r in rows.iter_mut() {
        r.yhat = r.yhat.max(0.0);
    }
    let metrics = performance_metrics(&rows, search.rolling_window)?;
    let first = metrics.first().ok_or_else(|| {
        BirdcastError::Prediction("cross-validation produced no metrics".to_string())
    })?;
    Ok(GridScore {
        params: params.clone(),
        rmse: first.rmse,
        mae: first.mae,
    })
}

/// Search the grid, refit the best model on the whole series and forecast.
pub fn run_series(
    key: &SeriesKey,
    table: &ModelTable,
    grid: &ParamGrid,
    config: &WorkerConfig,
) -> Result<SeriesForecast> {
    grid.validate()?;
    let frame = SeriesFrame::select(table, key, config.search.ewm_span)?;
    let data = frame.to_series()?;

    let combos = grid.combinations();
    let mut scores = Vec::with_capacity(combos.len());
    for params in &combos {
        let score = score_params(&config.model, params, &data, &config.search)?;
        if config.trace_fits {
            debug!(series = %key, ?params, rmse = score.rmse, mae = score.mae, "grid point scored");
        }
        scores.push(score);
    }

    let rmses: Vec<f64> = scores.iter().map(|s| s.rmse).collect();
    let best_idx = select_best(&rmses)
        .ok_or_else(|| BirdcastError::DataValidation("parameter grid is empty".to_string()))?;
    let best = scores[best_idx].clone();

    let mut model = build_model(&config.model, &best.params)?;
    model.fit(&data)?;
    if config.trace_fits {
        trace!(series = %key, model = %model.to_json()?, "best model");
    }

    let dates = model.make_future_dates(config.forecast.periods, Frequency::Weekly, true)?;
    let cap = vec![CAP; dates.len()];
    let floor = vec![FLOOR; dates.len()];
    let mut fcst = model.predict(&dates, Some(&cap), Some(&floor))?;
    fcst.clip_lower(0.0);

    let actual_by_date: HashMap<NaiveDate, Option<f64>> = frame
        .ds
        .iter()
        .copied()
        .zip(frame.actual.iter().copied())
        .collect();

    let last_year = frame.ds.last().map(|d| d.year()).unwrap_or_default();
    let max_year = config.forecast.max_year.unwrap_or(last_year + 2);
    let partial_year = config.forecast.partial_year.unwrap_or(last_year);

    let rows: Vec<ForecastRow> = (0..fcst.len())
        .map(|i| {
            let ds = fcst.ds[i];
            ForecastRow {
                ds,
                actual: actual_by_date.get(&ds).copied().flatten(),
                yhat: fcst.yhat[i],
                yhat_lower: fcst.yhat_lower[i],
                yhat_upper: fcst.yhat_upper[i],
                county: key.county.clone(),
                common_name: key.common_name.clone(),
                week: dt_to_week_number(ds),
                year: ds.year(),
            }
        })
        .filter(|r| !(r.week == 52 && r.actual.is_none() && r.year == partial_year))
        .filter(|r| r.week <= 52 && r.year <= max_year)
        .collect();

    debug!(
        series = %key,
        best = ?best.params,
        rmse = best.rmse,
        rows = rows.len(),
        "series forecast"
    );

    Ok(SeriesForecast {
        key: key.clone(),
        rows,
        accuracy: AccuracyRecord {
            county: key.county.clone(),
            common_name: key.common_name.clone(),
            rmse: best.rmse,
            mae: best.mae,
        },
        best_params: best.params,
        grid: scores,
    })
}
