use std::f64::consts::PI;

use chrono::{Datelike, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_CE_DAYS: i32 = 719_163;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalityConfig {
    pub name: String,
    pub period: f64,
    pub fourier_order: usize,
    pub prior_scale: f64,
}

impl SeasonalityConfig {
    pub fn new(name: &str, period: f64, fourier_order: usize) -> Self {
        Self {
            name: name.to_string(),
            period,
            fourier_order,
            prior_scale: 10.0,
        }
    }

    pub fn yearly(fourier_order: usize) -> Self {
        Self::new("yearly", 365.25, fourier_order)
    }

    pub fn with_prior_scale(mut self, scale: f64) -> Self {
        self.prior_scale = scale;
        self
    }

    pub fn n_features(&self) -> usize {
        2 * self.fourier_order
    }
}

/// Days since 1970-01-01, the time axis of every Fourier feature.
pub fn epoch_days(dates: &[NaiveDate]) -> Vec<f64> {
    dates
        .iter()
        .map(|d| (d.num_days_from_ce() - UNIX_EPOCH_CE_DAYS) as f64)
        .collect()
}

/// Generate Fourier series features for given times (t in model units of days) and period (in days)
pub fn fourier_series(t: &[f64], period: f64, order: usize) -> Vec<Vec<f64>> {
    let cols = 2 * order;
    let mut x = vec![vec![0.0; cols]; t.len()];
    for (i, &ti) in t.iter().enumerate() {
        for k in 1..=order {
            let c = 2.0 * PI * (k as f64) * ti / period;
            x[i][2 * (k - 1)] = c.sin();
            x[i][2 * (k - 1) + 1] = c.cos();
        }
    }
    x
}

/// Combine multiple seasonality blocks column-wise
pub fn hstack(blocks: &[Vec<Vec<f64>>]) -> Vec<Vec<f64>> {
    if blocks.is_empty() {
        return Vec::new();
    }
    let rows = blocks[0].len();
    let total_cols: usize = blocks
        .iter()
        .map(|b| if b.is_empty() { 0 } else { b[0].len() })
        .sum();
    let mut out = vec![vec![0.0; total_cols]; rows];
    for i in 0..rows {
        let mut col = 0;
        for block in blocks {
            if block.is_empty() {
                continue;
            }
            for &v in &block[i] {
                out[i][col] = v;
                col += 1;
            }
        }
    }
    out
}

/// Seasonal design matrix (rows = dates, columns = all Fourier terms of every
/// seasonality in order) plus the per-column prior scale.
pub fn seasonal_design(
    dates: &[NaiveDate],
    seasonalities: &[SeasonalityConfig],
) -> (Array2<f64>, Vec<f64>) {
    let t = epoch_days(dates);
    let blocks: Vec<Vec<Vec<f64>>> = seasonalities
        .iter()
        .map(|s| fourier_series(&t, s.period, s.fourier_order))
        .collect();
    let prior_scales: Vec<f64> = seasonalities
        .iter()
        .flat_map(|s| std::iter::repeat(s.prior_scale).take(s.n_features()))
        .collect();

    let cols = prior_scales.len();
    let stacked = hstack(&blocks);
    let mut x = Array2::zeros((dates.len(), cols));
    for (i, row) in stacked.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            x[[i, j]] = v;
        }
    }
    (x, prior_scales)
}
