//! Panel rows to model-ready series.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::calendar::week_year_to_dt;
use crate::panel::RollingPanel;
use crate::{BirdcastError, Result};

/// Upper bound of the saturating trend.
pub const CAP: f64 = 1.0;
/// Lower bound of the saturating trend.
pub const FLOOR: f64 = 0.0;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub common_name: String,
    pub county: String,
}

impl SeriesKey {
    pub fn new(common_name: impl Into<String>, county: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            county: county.into(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.common_name, self.county)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRow {
    pub common_name: String,
    pub county: String,
    pub year: i32,
    pub week: u32,
    pub ds: NaiveDate,
    pub y: Option<f64>,
    pub cap: f64,
    pub floor: f64,
}

/// Model-ready rows grouped by series, each group sorted by date.
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    series: BTreeMap<SeriesKey, Vec<ModelRow>>,
}

impl ModelTable {
    pub fn from_rows(rows: Vec<ModelRow>) -> Self {
        let mut series: BTreeMap<SeriesKey, Vec<ModelRow>> = BTreeMap::new();
        for row in rows {
            series
                .entry(SeriesKey::new(&row.common_name, &row.county))
                .or_default()
                .push(row);
        }
        for rows in series.values_mut() {
            rows.sort_by_key(|r| r.ds);
        }
        Self { series }
    }

    pub fn series(&self, key: &SeriesKey) -> Option<&[ModelRow]> {
        self.series.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SeriesKey> {
        self.series.keys()
    }

    /// Distinct species, sorted.
    pub fn species(&self) -> BTreeSet<&str> {
        self.series.keys().map(|k| k.common_name.as_str()).collect()
    }

    /// Distinct counties, sorted.
    pub fn counties(&self) -> BTreeSet<&str> {
        self.series.keys().map(|k| k.county.as_str()).collect()
    }

    pub fn n_series(&self) -> usize {
        self.series.len()
    }

    pub fn n_rows(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Turn the panel into model rows: detection rate becomes `y`, (week, year)
/// becomes `ds`, week 53 is dropped and the trend bounds are fixed to [0, 1].
pub fn preprocess(panel: &RollingPanel) -> Result<ModelTable> {
    let mut rows = Vec::with_capacity(panel.len());
    let mut dropped_53 = 0usize;

    for r in panel.rows() {
        if r.week == 53 {
            dropped_53 += 1;
            continue;
        }
        let ds = week_year_to_dt(r.week, r.year).ok_or_else(|| {
            BirdcastError::Schema(format!("invalid week {} of year {}", r.week, r.year))
        })?;
        rows.push(ModelRow {
            common_name: r.common_name.clone(),
            county: r.county.clone(),
            year: r.year,
            week: r.week,
            ds,
            y: r.detection_rate,
            cap: CAP,
            floor: FLOOR,
        });
    }

    let table = ModelTable::from_rows(rows);
    info!(
        series = table.n_series(),
        rows = table.n_rows(),
        dropped_53,
        "panel preprocessed"
    );
    Ok(table)
}
