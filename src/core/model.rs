use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::data::{ForecastResult, TimeSeriesData};
use crate::core::optimizer::{optimize, ModelParams, OptimizationConfig, SeriesModel, Solver};
use crate::core::seasonality::{seasonal_design, SeasonalityConfig};
use crate::core::trend::{
    future_dates, hinge_matrix, piecewise_linear, piecewise_logistic, scale_time,
    select_changepoints, time_scale,
};
use crate::{BirdcastError, Result};

pub use crate::core::trend::Frequency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthType {
    Linear,
    Logistic,
}

/// State produced by a successful fit.
#[derive(Debug, Clone)]
struct Fitted {
    history: TimeSeriesData,
    t0: NaiveDate,
    t_scale: f64,
    t_change: Vec<f64>,
    y_scale: f64,
    seasonalities: Vec<SeasonalityConfig>,
    params: ModelParams,
    iterations: u64,
    converged: bool,
    solver: Solver,
}

/// Saturating-growth forecaster: piecewise trend with changepoints plus
/// additive Fourier seasonality, fitted by MAP.
#[derive(Debug, Clone)]
pub struct Forecaster {
    growth: GrowthType,
    n_changepoints: usize,
    changepoint_range: f64,
    changepoint_prior_scale: f64,
    seasonality_prior_scale: f64,
    yearly_order: Option<usize>,
    interval_width: f64,
    optimizer: OptimizationConfig,
    fitted: Option<Fitted>,
}

impl Forecaster {
    pub fn new() -> Self {
        Self {
            growth: GrowthType::Logistic,
            n_changepoints: 25,
            changepoint_range: 0.8,
            changepoint_prior_scale: 0.05,
            seasonality_prior_scale: 10.0,
            yearly_order: Some(10),
            interval_width: 0.80,
            optimizer: OptimizationConfig::default(),
            fitted: None,
        }
    }

    pub fn with_growth(mut self, growth: GrowthType) -> Self {
        self.growth = growth;
        self
    }

    pub fn with_changepoints(mut self, n: usize) -> Self {
        self.n_changepoints = n;
        self
    }

    pub fn with_changepoint_range(mut self, range: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&range) {
            return Err(BirdcastError::DataValidation(format!(
                "changepoint_range must be between 0 and 1, got {}",
                range
            )));
        }
        self.changepoint_range = range;
        Ok(self)
    }

    pub fn with_changepoint_prior_scale(mut self, scale: f64) -> Result<Self> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(BirdcastError::DataValidation(format!(
                "changepoint_prior_scale must be positive, got {}",
                scale
            )));
        }
        self.changepoint_prior_scale = scale;
        Ok(self)
    }

    pub fn with_seasonality_prior_scale(mut self, scale: f64) -> Result<Self> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(BirdcastError::DataValidation(format!(
                "seasonality_prior_scale must be positive, got {}",
                scale
            )));
        }
        self.seasonality_prior_scale = scale;
        Ok(self)
    }

    /// Yearly seasonality with the given Fourier order (10 by default).
    pub fn with_yearly_seasonality(mut self, fourier_order: usize) -> Self {
        self.yearly_order = Some(fourier_order);
        self
    }

    pub fn without_yearly_seasonality(mut self) -> Self {
        self.yearly_order = None;
        self
    }

    pub fn with_interval_width(mut self, width: f64) -> Self {
        self.interval_width = width;
        self
    }

    pub fn with_optimizer(mut self, config: OptimizationConfig) -> Self {
        self.optimizer = config;
        self
    }

    /// A copy of this model's settings without any fitted state.
    pub fn unfitted(&self) -> Self {
        Self {
            fitted: None,
            ..self.clone()
        }
    }

    pub fn growth(&self) -> GrowthType {
        self.growth
    }

    pub fn n_changepoints(&self) -> usize {
        self.n_changepoints
    }

    pub fn changepoint_prior_scale(&self) -> f64 {
        self.changepoint_prior_scale
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn params(&self) -> Option<&ModelParams> {
        self.fitted.as_ref().map(|f| &f.params)
    }

    pub fn get_history(&self) -> Option<&TimeSeriesData> {
        self.fitted.as_ref().map(|f| &f.history)
    }

    fn seasonalities(&self) -> Vec<SeasonalityConfig> {
        self.yearly_order
            .filter(|order| *order > 0)
            .map(|order| {
                SeasonalityConfig::yearly(order).with_prior_scale(self.seasonality_prior_scale)
            })
            .into_iter()
            .collect()
    }

    pub fn fit(&mut self, data: &TimeSeriesData) -> Result<()> {
        if self.growth == GrowthType::Logistic && data.cap.is_none() {
            return Err(BirdcastError::DataValidation(
                "logistic growth requires a cap for every row".to_string(),
            ));
        }

        // Rows with a missing target only contribute their dates to the history
        let observed: Vec<usize> = (0..data.len()).filter(|&i| data.y[i].is_finite()).collect();
        if observed.len() < 2 {
            return Err(BirdcastError::InsufficientData {
                needed: 2,
                got: observed.len(),
            });
        }

        let ds: Vec<NaiveDate> = observed.iter().map(|&i| data.ds[i]).collect();
        let floor: Vec<f64> = observed
            .iter()
            .map(|&i| data.floor.as_ref().map_or(0.0, |f| f[i]))
            .collect();
        let y_raw: Vec<f64> = observed.iter().map(|&i| data.y[i]).collect();

        // Scale y (absmax of y - floor, minimum 1.0)
        let y_scale = y_raw
            .iter()
            .zip(&floor)
            .map(|(y, f)| (y - f).abs())
            .fold(0.0_f64, f64::max)
            .max(1.0);
        let y: Vec<f64> = y_raw
            .iter()
            .zip(&floor)
            .map(|(y, f)| (y - f) / y_scale)
            .collect();
        let cap: Vec<f64> = match (&self.growth, &data.cap) {
            (GrowthType::Logistic, Some(cap)) => observed
                .iter()
                .zip(&floor)
                .map(|(&i, f)| (cap[i] - f) / y_scale)
                .collect(),
            _ => vec![1.0; observed.len()],
        };
        if cap.iter().any(|c| *c <= 0.0) {
            return Err(BirdcastError::DataValidation(
                "cap must be greater than floor".to_string(),
            ));
        }

        let (t, t_scale, t0) = time_scale(&ds).ok_or(BirdcastError::InsufficientData {
            needed: 2,
            got: 0,
        })?;
        let t_change = select_changepoints(&t, self.n_changepoints, self.changepoint_range);

        let seasonalities = self.seasonalities();
        let (x, sigmas) = seasonal_design(&ds, &seasonalities);

        let model = SeriesModel {
            growth: self.growth,
            hinge: hinge_matrix(&t, &t_change),
            t,
            y,
            cap,
            x,
            sigmas,
            tau: self.changepoint_prior_scale,
        };
        let init = model.initialize_params();
        let result = optimize(&model, init, &self.optimizer)?;

        debug!(
            n_obs = model.n(),
            n_changepoints = t_change.len(),
            changepoint_prior_scale = self.changepoint_prior_scale,
            iterations = result.iterations,
            converged = result.converged,
            "model fitted"
        );

        self.fitted = Some(Fitted {
            history: data.clone(),
            t0,
            t_scale,
            t_change,
            y_scale,
            seasonalities,
            params: result.params,
            iterations: result.iterations,
            converged: result.converged,
            solver: result.solver,
        });
        Ok(())
    }

    /// Predict at `ds`. Logistic growth needs a cap per date; floor defaults to 0.
    pub fn predict(
        &self,
        ds: &[NaiveDate],
        cap: Option<&[f64]>,
        floor: Option<&[f64]>,
    ) -> Result<ForecastResult> {
        let fitted = self.fitted.as_ref().ok_or_else(|| {
            BirdcastError::Prediction("Model must be fitted before predicting".to_string())
        })?;

        let n = ds.len();
        let floor: Vec<f64> = match floor {
            Some(f) if f.len() == n => f.to_vec(),
            Some(f) => {
                return Err(BirdcastError::Prediction(format!(
                    "floor length ({}) must match prediction length ({})",
                    f.len(),
                    n
                )))
            }
            None => vec![0.0; n],
        };

        let t = scale_time(ds, fitted.t0, fitted.t_scale);
        let p = &fitted.params;
        let trend_scaled: Vec<f64> = match self.growth {
            GrowthType::Logistic => {
                let cap = cap.ok_or_else(|| {
                    BirdcastError::Prediction("logistic growth requires cap to predict".to_string())
                })?;
                if cap.len() != n {
                    return Err(BirdcastError::Prediction(format!(
                        "cap length ({}) must match prediction length ({})",
                        cap.len(),
                        n
                    )));
                }
                // Capacity above the floor, in the fitted y scale
                let cap_scaled: Vec<f64> = cap
                    .iter()
                    .zip(&floor)
                    .map(|(c, f)| (c - f) / fitted.y_scale)
                    .collect();
                piecewise_logistic(p.k, p.m, &p.delta, &t, &cap_scaled, &fitted.t_change)
            }
            GrowthType::Linear => piecewise_linear(p.k, p.m, &p.delta, &t, &fitted.t_change),
        };

        let (x, _) = seasonal_design(ds, &fitted.seasonalities);
        let seasonal: Vec<f64> = x.dot(&ndarray::Array1::from_vec(p.beta.clone())).to_vec();

        let trend: Vec<f64> = trend_scaled
            .iter()
            .zip(&floor)
            .map(|(v, f)| v * fitted.y_scale + f)
            .collect();
        let yearly: Vec<f64> = seasonal.iter().map(|v| v * fitted.y_scale).collect();
        let yhat: Vec<f64> = trend.iter().zip(&yearly).map(|(t, s)| t + s).collect();

        // Uncertainty intervals using sigma_obs and interval_width
        let z_score = match (self.interval_width * 100.0).round() as i32 {
            80 => 1.28,
            90 => 1.645,
            95 => 1.96,
            99 => 2.576,
            _ => 1.28, // default to 80%
        };
        let margin = z_score * p.sigma_obs * fitted.y_scale;
        let yhat_lower: Vec<f64> = yhat.iter().map(|&y| y - margin).collect();
        let yhat_upper: Vec<f64> = yhat.iter().map(|&y| y + margin).collect();

        Ok(ForecastResult {
            ds: ds.to_vec(),
            yhat,
            yhat_lower,
            yhat_upper,
            trend,
            yearly: if fitted.seasonalities.is_empty() {
                None
            } else {
                Some(yearly)
            },
        })
    }

    pub fn make_future_dates(
        &self,
        periods: usize,
        freq: Frequency,
        include_history: bool,
    ) -> Result<Vec<NaiveDate>> {
        let history = self.get_history().ok_or_else(|| {
            BirdcastError::Prediction(
                "Model must be fitted before making future dates".to_string(),
            )
        })?;
        let last = *history.ds.last().ok_or_else(|| {
            BirdcastError::Prediction("history has no dates".to_string())
        })?;

        let mut out = Vec::with_capacity(periods + history.len());
        if include_history {
            out.extend_from_slice(&history.ds);
        }
        out.extend(future_dates(last, periods, freq));
        Ok(out)
    }

    pub fn get_params(&self) -> serde_json::Value {
        let fitted = self.fitted.as_ref();
        serde_json::json!({
            "fitted": fitted.is_some(),
            "growth": self.growth,
            "n_changepoints": self.n_changepoints,
            "changepoint_range": self.changepoint_range,
            "changepoint_prior_scale": self.changepoint_prior_scale,
            "seasonality_prior_scale": self.seasonality_prior_scale,
            "yearly_order": self.yearly_order,
            "interval_width": self.interval_width,

            // Fitted parameters (only if fitted)
            "t0": fitted.map(|f| f.t0.format("%Y-%m-%d").to_string()),
            "t_scale": fitted.map(|f| f.t_scale),
            "y_scale": fitted.map(|f| f.y_scale),
            "t_change": fitted.map(|f| f.t_change.clone()),
            "params": fitted.map(|f| f.params.clone()),
            "iterations": fitted.map(|f| f.iterations),
            "converged": fitted.map(|f| f.converged),
            "solver": fitted.map(|f| f.solver),
        })
    }

    /// Serialize model settings and fitted parameters to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.get_params())?)
    }
}

impl Default for Forecaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn weekly_dates(n: usize) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
        (0..n).map(|i| start + Duration::weeks(i as i64)).collect()
    }

    fn seasonal_series(n: usize) -> TimeSeriesData {
        let ds = weekly_dates(n);
        let y: Vec<f64> = (0..n)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * (i as f64) / 52.18;
                0.3 + 0.15 * phase.sin()
            })
            .collect();
        TimeSeriesData::new(ds, y, Some(vec![1.0; n]), Some(vec![0.0; n])).unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let m = Forecaster::new();
        assert_eq!(m.growth(), GrowthType::Logistic);
        assert_eq!(m.n_changepoints(), 25);
        assert!(!m.is_fitted());
    }

    #[test]
    fn test_invalid_changepoint_range() {
        assert!(Forecaster::new().with_changepoint_range(1.5).is_err());
        assert!(Forecaster::new().with_changepoint_prior_scale(0.0).is_err());
    }

    #[test]
    fn test_predicted_trend_is_scaled_piecewise_logistic() {
        let data = seasonal_series(80);
        let mut m = Forecaster::new()
            .with_changepoints(3)
            .without_yearly_seasonality();
        m.fit(&data).unwrap();

        let cap = vec![0.8; data.len()];
        let floor = vec![0.1; data.len()];
        let fcst = m.predict(&data.ds, Some(&cap), Some(&floor)).unwrap();

        let fitted = m.fitted.as_ref().unwrap();
        let t = scale_time(&data.ds, fitted.t0, fitted.t_scale);
        let p = &fitted.params;
        let cap_scaled = vec![0.7 / fitted.y_scale; data.len()];
        let expected = piecewise_logistic(p.k, p.m, &p.delta, &t, &cap_scaled, &fitted.t_change);
        for (got, want) in fcst.trend.iter().zip(&expected) {
            assert!((got - (want * fitted.y_scale + 0.1)).abs() < 1e-9);
        }
        assert!(fcst.trend.iter().all(|v| *v > 0.1 && *v < 0.8));
    }

    #[test]
    fn test_logistic_requires_cap() {
        let mut m = Forecaster::new();
        let data = TimeSeriesData::new(weekly_dates(3), vec![0.1, 0.2, 0.3], None, None).unwrap();
        assert!(matches!(m.fit(&data), Err(BirdcastError::DataValidation(_))));
    }

    #[test]
    fn test_fit_requires_two_observations() {
        let mut m = Forecaster::new();
        let data = TimeSeriesData::new(
            weekly_dates(3),
            vec![f64::NAN, 0.2, f64::NAN],
            Some(vec![1.0; 3]),
            None,
        )
        .unwrap();
        assert!(matches!(
            m.fit(&data),
            Err(BirdcastError::InsufficientData { needed: 2, got: 1 })
        ));
    }

    #[test]
    fn test_predict_before_fit_fails() {
        let m = Forecaster::new();
        assert!(m.predict(&weekly_dates(2), Some(&[1.0, 1.0]), None).is_err());
        assert!(m.make_future_dates(3, Frequency::Weekly, false).is_err());
    }

    #[test]
    fn test_fit_and_predict_stays_below_cap() {
        let data = seasonal_series(156);
        let mut m = Forecaster::new().with_changepoint_prior_scale(0.5).unwrap();
        m.fit(&data).unwrap();

        let future = m.make_future_dates(26, Frequency::Weekly, true).unwrap();
        assert_eq!(future.len(), 156 + 26);
        let cap = vec![1.0; future.len()];
        let fcst = m.predict(&future, Some(&cap), None).unwrap();

        assert_eq!(fcst.len(), future.len());
        for i in 0..fcst.len() {
            assert!(fcst.trend[i] <= 1.0 + 1e-9);
            assert!(fcst.yhat_lower[i] <= fcst.yhat[i]);
            assert!(fcst.yhat[i] <= fcst.yhat_upper[i]);
        }
        assert!(fcst.yearly.is_some());

        // In-sample fit should track the level of the series
        let mean_fit: f64 = fcst.yhat[..156].iter().sum::<f64>() / 156.0;
        assert!((mean_fit - 0.3).abs() < 0.1, "mean fit {}", mean_fit);
    }

    #[test]
    fn test_linear_growth_without_seasonality() {
        let ds = weekly_dates(20);
        let y: Vec<f64> = (0..20).map(|i| 2.0 + 0.5 * i as f64).collect();
        let data = TimeSeriesData::new(ds.clone(), y, None, None).unwrap();
        let mut m = Forecaster::new()
            .with_growth(GrowthType::Linear)
            .with_changepoints(0)
            .without_yearly_seasonality();
        m.fit(&data).unwrap();

        let fcst = m.predict(&ds, None, None).unwrap();
        assert!(fcst.yearly.is_none());
        assert!((fcst.yhat[0] - 2.0).abs() < 0.5);
        assert!((fcst.yhat[19] - 11.5).abs() < 0.5);
    }

    #[test]
    fn test_unfitted_clone_drops_state() {
        let data = seasonal_series(60);
        let mut m = Forecaster::new().with_changepoints(5);
        m.fit(&data).unwrap();
        assert!(m.is_fitted());
        let fresh = m.unfitted();
        assert!(!fresh.is_fitted());
        assert_eq!(fresh.n_changepoints(), 5);
    }

    #[test]
    fn test_to_json_contains_params() {
        let data = seasonal_series(60);
        let mut m = Forecaster::new();
        m.fit(&data).unwrap();
        let json = m.to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["fitted"], true);
        assert_eq!(v["growth"], "logistic");
        assert!(v["params"]["sigma_obs"].as_f64().unwrap() > 0.0);
    }
}
