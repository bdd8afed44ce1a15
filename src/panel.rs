//! Weekly detection-rate panel and its incremental update.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::calendar::{WeekConvention, WeekKey};
use crate::{BirdcastError, Result};

/// One cleaned observation: a species recorded on a checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub checklist_id: String,
    pub common_name: String,
    pub county: String,
    pub observation_date: NaiveDate,
}

/// Weekly aggregate for one (species, county).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRow {
    pub common_name: String,
    pub county: String,
    pub year: i32,
    pub week: u32,
    #[serde(rename = "numChecklist_withSpecies")]
    pub species_checklists: Option<u32>,
    #[serde(rename = "totalChecklist_byWeekLocation")]
    pub total_checklists: Option<u32>,
    pub detection_rate: Option<f64>,
}

impl PanelRow {
    pub fn week_key(&self) -> WeekKey {
        WeekKey::new(self.year, self.week)
    }
}

/// The persisted multi-year panel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollingPanel {
    rows: Vec<PanelRow>,
}

impl RollingPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<PanelRow>) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|r| r.week == 0 || r.week > 53) {
            return Err(BirdcastError::Schema(format!(
                "panel row for {} / {} has week {} outside 1..=53",
                bad.common_name, bad.county, bad.week
            )));
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[PanelRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<PanelRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn species(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.common_name.as_str()).collect()
    }

    /// Every (year, week) present in the panel.
    pub fn weeks(&self) -> HashSet<WeekKey> {
        self.rows.iter().map(PanelRow::week_key).collect()
    }

    /// Keep only the last `years` calendar years present; returns the number
    /// of rows removed. A span of zero keeps everything.
    pub fn retain_last_years(&mut self, years: u32) -> usize {
        let Some(max_year) = self.rows.iter().map(|r| r.year).max() else {
            return 0;
        };
        let Some(min_year) = i32::try_from(years)
            .ok()
            .filter(|span| *span > 0)
            .and_then(|span| max_year.checked_sub(span - 1))
        else {
            return 0;
        };
        let before = self.rows.len();
        self.rows.retain(|r| r.year >= min_year);
        before - self.rows.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// A county-week with at most this many checklists gets no rate.
    pub min_checklists: u32,
    /// Drop panel years older than this many years after each update.
    pub retain_years: Option<u32>,
}

impl PanelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retain_years == Some(0) {
            return Err(BirdcastError::DataValidation(
                "retain_years must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            min_checklists: 5,
            retain_years: None,
        }
    }
}

/// Outcome of one incremental update.
#[derive(Debug, Clone)]
pub struct PanelUpdate {
    pub panel: RollingPanel,
    pub rows_added: usize,
    /// Rows removed by year retention.
    pub rows_pruned: usize,
    pub duplicates_dropped: usize,
    pub stale_records_dropped: usize,
}

impl PanelUpdate {
    /// Whether the panel differs from the one passed in.
    pub fn changed(&self) -> bool {
        self.rows_added > 0 || self.rows_pruned > 0
    }
}

/// Detection rate for one cell.
///
/// No rate without a total or when the total is at or below
/// `min_checklists`; a missing species count with a usable total is a zero.
pub fn detection_rate(
    species_checklists: Option<u32>,
    total_checklists: Option<u32>,
    min_checklists: u32,
) -> Option<f64> {
    let total = total_checklists?;
    if total <= min_checklists {
        return None;
    }
    let count = species_checklists.unwrap_or(0);
    Some(count as f64 / total as f64)
}

/// Merge a batch of cleaned observations into the panel.
///
/// The batch is bucketed by ISO week. Records whose week already appears in
/// the panel are ignored and no row is emitted for a committed week, so
/// re-running an update with the same batch leaves the panel unchanged and
/// every (species, county, year, week) stays unique.
pub fn update_panel(
    current: &RollingPanel,
    batch: &[Observation],
    config: &PanelConfig,
) -> Result<PanelUpdate> {
    config.validate()?;
    let convention = WeekConvention::Iso;

    // Deduplicate by (checklist, species), keep first
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let deduped: Vec<&Observation> = batch
        .iter()
        .filter(|o| seen.insert((o.checklist_id.as_str(), o.common_name.as_str())))
        .collect();
    let duplicates_dropped = batch.len() - deduped.len();

    let existing = current.weeks();
    let filtered: Vec<(&Observation, WeekKey)> = deduped
        .into_iter()
        .map(|o| (o, convention.week_of(o.observation_date)))
        .filter(|(_, key)| !existing.contains(key))
        .collect();
    let stale_records_dropped = batch.len() - duplicates_dropped - filtered.len();

    if filtered.is_empty() {
        let mut panel = current.clone();
        let rows_pruned = config
            .retain_years
            .map_or(0, |years| panel.retain_last_years(years));
        info!(
            duplicates_dropped,
            stale_records_dropped, rows_pruned, "no new weeks in batch"
        );
        return Ok(PanelUpdate {
            panel,
            rows_added: 0,
            rows_pruned,
            duplicates_dropped,
            stale_records_dropped,
        });
    }

    // Species count per (species, county, week) and distinct checklists per (county, week)
    let mut species_counts: HashMap<(&str, &str, WeekKey), u32> = HashMap::new();
    let mut checklists: HashMap<(&str, WeekKey), HashSet<&str>> = HashMap::new();
    for (o, key) in &filtered {
        *species_counts
            .entry((o.common_name.as_str(), o.county.as_str(), *key))
            .or_insert(0) += 1;
        checklists
            .entry((o.county.as_str(), *key))
            .or_default()
            .insert(o.checklist_id.as_str());
    }

    let counties: BTreeSet<&str> = filtered.iter().map(|(o, _)| o.county.as_str()).collect();
    let years: BTreeSet<i32> = filtered.iter().map(|(_, k)| k.year).collect();
    let max_week = filtered.iter().map(|(_, k)| k.week).max().unwrap_or(0);

    // Years whose highest observed ISO week is 53
    let mut max_week_by_year: BTreeMap<i32, u32> = BTreeMap::new();
    for (_, key) in &filtered {
        let w = max_week_by_year.entry(key.year).or_insert(0);
        *w = (*w).max(key.week);
    }

    let mut species: BTreeSet<&str> = current.species();
    species.extend(filtered.iter().map(|(o, _)| o.common_name.as_str()));

    let mut new_rows = Vec::new();
    for name in &species {
        for county in &counties {
            for &year in &years {
                let weeks_in_year = if max_week_by_year.get(&year) == Some(&53) {
                    53
                } else {
                    52
                };
                for week in 1..=weeks_in_year.min(max_week) {
                    let key = WeekKey::new(year, week);
                    if existing.contains(&key) {
                        continue;
                    }
                    let total = checklists
                        .get(&(*county, key))
                        .map(|set| set.len() as u32);
                    let count = species_counts.get(&(*name, *county, key)).copied();
                    new_rows.push(PanelRow {
                        common_name: name.to_string(),
                        county: county.to_string(),
                        year,
                        week,
                        species_checklists: count,
                        total_checklists: total,
                        detection_rate: detection_rate(count, total, config.min_checklists),
                    });
                }
            }
        }
    }

    let rows_added = new_rows.len();
    let mut rows = current.rows.clone();
    rows.extend(new_rows);
    let mut panel = RollingPanel { rows };
    let rows_pruned = config
        .retain_years
        .map_or(0, |years| panel.retain_last_years(years));

    debug!(
        species = species.len(),
        counties = counties.len(),
        years = years.len(),
        max_week,
        "panel grid built"
    );
    info!(
        rows_added,
        duplicates_dropped,
        stale_records_dropped,
        rows_pruned,
        total_rows = panel.len(),
        "panel updated"
    );

    Ok(PanelUpdate {
        panel,
        rows_added,
        rows_pruned,
        duplicates_dropped,
        stale_records_dropped,
    })
}
