//! Rolling-origin cross-validation and horizon-windowed performance metrics.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::data::TimeSeriesData;
use crate::core::model::Forecaster;
use crate::{BirdcastError, Result};

/// Configuration for rolling-origin cross-validation, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CvConfig {
    /// Forecast horizon for each fold.
    pub horizon_days: i64,
    /// Minimum training span before the first cutoff.
    pub initial_days: i64,
    /// Spacing between cutoffs.
    pub period_days: i64,
}

impl CvConfig {
    /// Horizon in whole weeks, with initial = 3 * horizon and period = horizon / 2.
    pub fn from_weeks(horizon_weeks: i64) -> Self {
        let horizon_days = horizon_weeks * 7;
        Self {
            horizon_days,
            initial_days: 3 * horizon_days,
            period_days: horizon_days / 2,
        }
    }

    pub fn with_initial_days(mut self, days: i64) -> Self {
        self.initial_days = days;
        self
    }

    pub fn with_period_days(mut self, days: i64) -> Self {
        self.period_days = days;
        self
    }

    fn horizon(&self) -> Duration {
        Duration::days(self.horizon_days)
    }
}

impl Default for CvConfig {
    fn default() -> Self {
        Self::from_weeks(110)
    }
}

/// One out-of-sample prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvRow {
    pub ds: NaiveDate,
    pub cutoff: NaiveDate,
    pub y: f64,
    pub yhat: f64,
    pub yhat_lower: f64,
    pub yhat_upper: f64,
}

impl CvRow {
    pub fn horizon_days(&self) -> i64 {
        (self.ds - self.cutoff).num_days()
    }
}

/// Metrics for one horizon, aggregated over a rolling window of points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizonMetrics {
    pub horizon_days: i64,
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
}

/// Cutoff dates for cross-validation, oldest first.
///
/// The first candidate is `last - horizon`; further cutoffs step back by
/// `period` while the previous one is still at least `initial` past the first
/// date. A cutoff whose horizon window holds no data jumps back to the last
/// date before it minus the horizon. The last candidate generated is always
/// dropped.
pub fn generate_cutoffs(ds: &[NaiveDate], config: &CvConfig) -> Result<Vec<NaiveDate>> {
    let (Some(&first), Some(&last)) = (ds.first(), ds.last()) else {
        return Err(BirdcastError::InsufficientData { needed: 1, got: 0 });
    };
    let horizon = config.horizon();
    let initial = Duration::days(config.initial_days);
    let period = Duration::days(config.period_days.max(1));

    let mut cutoff = last - horizon;
    if cutoff < first {
        return Err(BirdcastError::DataValidation(
            "Less data than horizon".to_string(),
        ));
    }

    let mut result = vec![cutoff];
    while result.last().is_some_and(|c| *c >= first + initial) {
        cutoff -= period;
        let window_has_data = ds.iter().any(|d| *d > cutoff && *d <= cutoff + horizon);
        if !window_has_data && cutoff > first {
            if let Some(closest) = ds.iter().filter(|d| **d <= cutoff).max() {
                cutoff = *closest - horizon;
            }
        }
        result.push(cutoff);
    }
    result.pop();

    if result.is_empty() {
        return Err(BirdcastError::DataValidation(
            "Less data than horizon after initial window. Make horizon or initial shorter."
                .to_string(),
        ));
    }
    result.reverse();
    Ok(result)
}

/// Refit `template` at every cutoff and predict the following horizon.
///
/// Only rows with an observed target take part: they define the cutoffs,
/// train each fold and are scored.
pub fn cross_validation(
    template: &Forecaster,
    data: &TimeSeriesData,
    config: &CvConfig,
) -> Result<Vec<CvRow>> {
    let keep: Vec<usize> = (0..data.len()).filter(|&i| data.y[i].is_finite()).collect();
    let pick = |v: &Vec<f64>| keep.iter().map(|&i| v[i]).collect::<Vec<f64>>();
    let observed = TimeSeriesData::new(
        keep.iter().map(|&i| data.ds[i]).collect(),
        pick(&data.y),
        data.cap.as_ref().map(pick),
        data.floor.as_ref().map(pick),
    )?;

    let cutoffs = generate_cutoffs(&observed.ds, config)?;
    let horizon = config.horizon();
    let mut rows = Vec::new();

    for cutoff in cutoffs {
        let train = observed.truncate_to(cutoff);
        if train.len() < 2 {
            return Err(BirdcastError::InsufficientData {
                needed: 2,
                got: train.len(),
            });
        }
        let mut model = template.unfitted();
        model.fit(&train)?;

        let start = train.len();
        let end = observed.ds.partition_point(|d| *d <= cutoff + horizon);
        if start >= end {
            continue;
        }
        let ds = &observed.ds[start..end];
        let cap = observed.cap.as_ref().map(|c| &c[start..end]);
        let floor = observed.floor.as_ref().map(|f| &f[start..end]);
        let fcst = model.predict(ds, cap, floor)?;

        for (j, &d) in ds.iter().enumerate() {
            rows.push(CvRow {
                ds: d,
                cutoff,
                y: observed.y[start + j],
                yhat: fcst.yhat[j],
                yhat_lower: fcst.yhat_lower[j],
                yhat_upper: fcst.yhat_upper[j],
            });
        }
        debug!(%cutoff, n_train = train.len(), n_test = end - start, "cv fold done");
    }

    Ok(rows)
}

/// Mean of `x` over a rolling window of `w` points, ordered by horizon.
///
/// Points sharing a horizon are grouped. Walking from the longest horizon
/// back, each horizon gets the mean of exactly `w` points: its own group
/// plus the next shorter groups, with the last group partially weighted.
/// Horizons with fewer than `w` points at or after them are omitted.
pub fn rolling_mean_by_h(x: &[f64], h: &[i64], w: usize) -> Vec<(i64, f64)> {
    let mut groups: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for (&xi, &hi) in x.iter().zip(h) {
        let entry = groups.entry(hi).or_insert((0.0, 0));
        entry.0 += xi;
        entry.1 += 1;
    }
    let hs: Vec<i64> = groups.keys().copied().collect();
    let xs: Vec<f64> = groups.values().map(|g| g.0).collect();
    let ns: Vec<usize> = groups.values().map(|g| g.1).collect();

    let n_groups = hs.len();
    let w = w.max(1);
    let mut res = vec![0.0; n_groups];
    // One past the index of the current trailing group.
    let mut trailing = n_groups;
    let mut x_sum = 0.0;
    let mut n_sum = 0usize;

    for i in (0..n_groups).rev() {
        x_sum += xs[i];
        n_sum += ns[i];
        while n_sum >= w && trailing > 0 {
            let excess_n = (n_sum - w) as f64;
            let excess_x = excess_n * xs[i] / ns[i] as f64;
            res[trailing - 1] = (x_sum - excess_x) / w as f64;
            x_sum -= xs[trailing - 1];
            n_sum -= ns[trailing - 1];
            trailing -= 1;
        }
    }

    hs[trailing..]
        .iter()
        .copied()
        .zip(res[trailing..].iter().copied())
        .collect()
}

/// RMSE and MAE by horizon. `rolling_window` is the fraction of points in
/// each window; a negative value disables aggregation.
pub fn performance_metrics(rows: &[CvRow], rolling_window: f64) -> Result<Vec<HorizonMetrics>> {
    if rows.is_empty() {
        return Err(BirdcastError::InsufficientData { needed: 1, got: 0 });
    }

    let mut sorted: Vec<&CvRow> = rows.iter().collect();
    sorted.sort_by_key(|r| r.horizon_days());
    let h: Vec<i64> = sorted.iter().map(|r| r.horizon_days()).collect();
    let se: Vec<f64> = sorted.iter().map(|r| (r.y - r.yhat).powi(2)).collect();
    let ae: Vec<f64> = sorted.iter().map(|r| (r.y - r.yhat).abs()).collect();

    if rolling_window < 0.0 {
        return Ok(h
            .iter()
            .zip(se.iter().zip(&ae))
            .map(|(&horizon_days, (&mse, &mae))| HorizonMetrics {
                horizon_days,
                mse,
                rmse: mse.sqrt(),
                mae,
            })
            .collect());
    }

    let n = sorted.len();
    let w = ((rolling_window * n as f64) as usize).clamp(1, n);
    let mse = rolling_mean_by_h(&se, &h, w);
    let mae = rolling_mean_by_h(&ae, &h, w);

    Ok(mse
        .into_iter()
        .zip(mae)
        .map(|((horizon_days, mse), (_, mae))| HorizonMetrics {
            horizon_days,
            mse,
            rmse: mse.sqrt(),
            mae,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weekly(start: NaiveDate, n: usize) -> Vec<NaiveDate> {
        (0..n).map(|i| start + Duration::weeks(i as i64)).collect()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_cv_config_from_weeks() {
        let cfg = CvConfig::from_weeks(110);
        assert_eq!(cfg.horizon_days, 770);
        assert_eq!(cfg.initial_days, 2310);
        assert_eq!(cfg.period_days, 385);
    }

    #[test]
    fn test_generate_cutoffs_daily() {
        // 100 days, horizon 10, period 10, initial 50
        let ds: Vec<NaiveDate> = (0..100).map(|i| d(2020, 1, 1) + Duration::days(i)).collect();
        let cfg = CvConfig {
            horizon_days: 10,
            initial_days: 50,
            period_days: 10,
        };
        let cutoffs = generate_cutoffs(&ds, &cfg).unwrap();

        // last = day 99; cutoffs 89, 79, 69, 59, 49 generated, 49 dropped
        let expected: Vec<NaiveDate> = [59, 69, 79, 89]
            .iter()
            .map(|&k| d(2020, 1, 1) + Duration::days(k))
            .collect();
        assert_eq!(cutoffs, expected);
    }

    #[test]
    fn test_generate_cutoffs_skips_gap() {
        // Data gap between day 20 and day 60
        let mut ds: Vec<NaiveDate> = (0..20).map(|i| d(2020, 1, 1) + Duration::days(i)).collect();
        ds.extend((60..80).map(|i| d(2020, 1, 1) + Duration::days(i)));
        let cfg = CvConfig {
            horizon_days: 5,
            initial_days: 5,
            period_days: 20,
        };
        let cutoffs = generate_cutoffs(&ds, &cfg).unwrap();
        for c in &cutoffs {
            let has = ds.iter().any(|x| *x > *c && *x <= *c + Duration::days(5));
            assert!(has, "cutoff {} has an empty horizon", c);
        }
        assert!(cutoffs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_generate_cutoffs_too_short() {
        let ds = weekly(d(2020, 1, 1), 10);
        let cfg = CvConfig::from_weeks(20);
        assert!(generate_cutoffs(&ds, &cfg).is_err());

        // Enough for the horizon but not for the initial window
        let cfg = CvConfig::from_weeks(4);
        assert!(generate_cutoffs(&ds, &cfg).is_err());
    }

    #[test]
    fn test_rolling_mean_by_h_window_one() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let h = [1, 2, 3, 4];
        let res = rolling_mean_by_h(&x, &h, 1);
        assert_eq!(res, vec![(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0)]);
    }

    #[test]
    fn test_rolling_mean_by_h_groups_and_partial_weights() {
        let x: Vec<f64> = (0..10).map(|v| v as f64).collect();
        let h = [1, 1, 2, 2, 3, 3, 4, 4, 5, 5];

        let res = rolling_mean_by_h(&x, &h, 2);
        assert_eq!(res.len(), 5);
        let expected = [0.5, 2.5, 4.5, 6.5, 8.5];
        for ((_, got), want) in res.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }

        let res = rolling_mean_by_h(&x, &h, 3);
        assert_eq!(res.iter().map(|r| r.0).collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        // Each window: one full group of two plus half of the shorter group
        let expected = [11.0 / 6.0, 23.0 / 6.0, 35.0 / 6.0, 47.0 / 6.0];
        for ((_, got), want) in res.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }

        let res = rolling_mean_by_h(&x, &h, 10);
        assert_eq!(res, vec![(5, 4.5)]);
    }

    #[test]
    fn test_performance_metrics_first_row_is_shortest_horizon() {
        let cutoff = d(2020, 1, 1);
        let rows: Vec<CvRow> = (1..=20)
            .map(|i| CvRow {
                ds: cutoff + Duration::days(i),
                cutoff,
                y: 1.0,
                yhat: 1.0 + if i <= 10 { 0.1 } else { 0.5 },
                yhat_lower: 0.0,
                yhat_upper: 2.0,
            })
            .collect();
        let m = performance_metrics(&rows, 0.1).unwrap();
        // w = 2 points; first window covers horizons 1 and 2
        assert_eq!(m[0].horizon_days, 2);
        assert!((m[0].rmse - 0.1).abs() < 1e-12);
        assert!((m[0].mae - 0.1).abs() < 1e-12);
        let last = m.last().unwrap();
        assert!((last.mae - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_performance_metrics_empty() {
        assert!(performance_metrics(&[], 0.1).is_err());
    }

    #[test]
    fn test_cross_validation_rows_fall_inside_horizon() {
        let n = 160;
        let ds = weekly(d(2015, 1, 1), n);
        let y: Vec<f64> = (0..n)
            .map(|i| 0.3 + 0.1 * (2.0 * std::f64::consts::PI * i as f64 / 52.18).sin())
            .collect();
        let data = TimeSeriesData::new(ds, y, Some(vec![1.0; n]), Some(vec![0.0; n])).unwrap();
        let template = Forecaster::new().with_changepoints(5);
        let cfg = CvConfig::from_weeks(26);

        let rows = cross_validation(&template, &data, &cfg).unwrap();
        assert!(!rows.is_empty());
        for r in &rows {
            assert!(r.ds > r.cutoff);
            assert!(r.horizon_days() <= cfg.horizon_days);
        }
        let metrics = performance_metrics(&rows, 0.1).unwrap();
        assert!(metrics[0].rmse.is_finite());
    }
}
