use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Input series for the forecaster. Missing targets are stored as NaN and
/// are skipped during fitting.
#[derive(Debug, Clone)]
pub struct TimeSeriesData {
    pub ds: Vec<NaiveDate>,
    pub y: Vec<f64>,
    pub cap: Option<Vec<f64>>,
    pub floor: Option<Vec<f64>>,
}

impl TimeSeriesData {
    pub fn new(
        ds: Vec<NaiveDate>,
        y: Vec<f64>,
        cap: Option<Vec<f64>>,
        floor: Option<Vec<f64>>,
    ) -> crate::Result<Self> {
        if ds.len() != y.len() {
            return Err(crate::BirdcastError::DataValidation(
                "ds and y must have same length".to_string(),
            ));
        }

        if let Some(ref cap) = cap {
            if cap.len() != ds.len() {
                return Err(crate::BirdcastError::DataValidation(
                    "cap must have same length as ds".to_string(),
                ));
            }
        }

        if let Some(ref floor) = floor {
            if floor.len() != ds.len() {
                return Err(crate::BirdcastError::DataValidation(
                    "floor must have same length as ds".to_string(),
                ));
            }
        }

        if ds.windows(2).any(|w| w[1] < w[0]) {
            return Err(crate::BirdcastError::DataValidation(
                "ds must be sorted ascending".to_string(),
            ));
        }

        Ok(Self { ds, y, cap, floor })
    }

    pub fn len(&self) -> usize {
        self.ds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ds.is_empty()
    }

    /// Number of rows with a usable (finite) target.
    pub fn n_observed(&self) -> usize {
        self.y.iter().filter(|v| v.is_finite()).count()
    }

    /// Rows with `ds <= cutoff`, used to train a cross-validation fold.
    pub fn truncate_to(&self, cutoff: NaiveDate) -> Self {
        let end = self.ds.partition_point(|d| *d <= cutoff);
        Self {
            ds: self.ds[..end].to_vec(),
            y: self.y[..end].to_vec(),
            cap: self.cap.as_ref().map(|c| c[..end].to_vec()),
            floor: self.floor.as_ref().map(|f| f[..end].to_vec()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastResult {
    pub ds: Vec<NaiveDate>,
    pub yhat: Vec<f64>,
    pub yhat_lower: Vec<f64>,
    pub yhat_upper: Vec<f64>,
    pub trend: Vec<f64>,
    pub yearly: Option<Vec<f64>>,
}

impl ForecastResult {
    pub fn len(&self) -> usize {
        self.ds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ds.is_empty()
    }

    /// Clamp point forecasts from below. Bounds are left untouched.
    pub fn clip_lower(&mut self, min: f64) {
        for v in self.yhat.iter_mut() {
            if *v < min {
                *v = min;
            }
        }
    }
}
