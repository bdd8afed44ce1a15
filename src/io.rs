//! Reading and writing panel, batch and output tables.
//!
//! Feather (Arrow IPC) goes through polars; CSV through the `csv` crate.
//! Every write lands in a temporary file next to the target and is renamed
//! into place, so readers never see a partial table.

use std::fs::File;
use std::path::Path;

use chrono::NaiveDate;
use polars::prelude::*;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::info;

use crate::panel::{Observation, PanelRow, RollingPanel};
use crate::{BirdcastError, Result};

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_CE_DAYS: i32 = 719_163;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Feather,
    Csv,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("feather") | Some("arrow") | Some("ipc") => Ok(Self::Feather),
            Some("csv") => Ok(Self::Csv),
            _ => Err(BirdcastError::Schema(format!(
                "unsupported table format: {}",
                path.display()
            ))),
        }
    }
}

/// Write through a temporary file in the target's directory, then rename.
fn atomic_write<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| BirdcastError::Io(e.error))?;
    Ok(())
}

/// Write rows as CSV. `headers` is only used when there are no rows.
pub fn write_csv<T: Serialize>(path: &Path, headers: &[&str], rows: &[T]) -> Result<()> {
    atomic_write(path, |file| {
        let mut wtr = csv::Writer::from_writer(file);
        if rows.is_empty() {
            wtr.write_record(headers)?;
        }
        for row in rows {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    })?;
    info!(path = %path.display(), rows = rows.len(), "table written");
    Ok(())
}

fn read_csv<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let rows = rdr.deserialize().collect::<std::result::Result<Vec<T>, _>>()?;
    Ok(rows)
}

fn read_ipc(path: &Path) -> Result<DataFrame> {
    let file = File::open(path)?;
    Ok(IpcReader::new(file).finish()?)
}

fn column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Series> {
    df.column(name)
        .map_err(|_| BirdcastError::Schema(format!("missing column '{}'", name)))
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let s = column(df, name)?.cast(&DataType::String)?;
    s.str()?
        .into_iter()
        .map(|v| {
            v.map(str::to_string)
                .ok_or_else(|| BirdcastError::Schema(format!("null in column '{}'", name)))
        })
        .collect()
}

/// Integer column; string-typed numbers are parsed.
fn opt_int_column(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>> {
    let s = column(df, name)?.cast(&DataType::Int64)?;
    Ok(s.i64()?.into_iter().collect())
}

fn opt_float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let s = column(df, name)?.cast(&DataType::Float64)?;
    Ok(s.f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

fn date_column(df: &DataFrame, name: &str) -> Result<Vec<NaiveDate>> {
    let s = column(df, name)?;
    let null = || BirdcastError::Schema(format!("null or invalid date in column '{}'", name));
    if s.dtype() == &DataType::String {
        return s
            .str()?
            .into_iter()
            .map(|v| {
                v.and_then(|text| NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok())
                    .ok_or_else(null)
            })
            .collect();
    }
    let days = s.cast(&DataType::Date)?.cast(&DataType::Int32)?;
    days.i32()?
        .into_iter()
        .map(|v| {
            v.and_then(|d| NaiveDate::from_num_days_from_ce_opt(d + UNIX_EPOCH_CE_DAYS))
                .ok_or_else(null)
        })
        .collect()
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| BirdcastError::Schema(format!("null in column '{}'", name)))
}

fn to_count(value: Option<i64>, name: &str) -> Result<Option<u32>> {
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| {
                BirdcastError::Schema(format!("negative or oversized count {} in '{}'", v, name))
            })
        })
        .transpose()
}

const SPECIES_COUNT: &str = "numChecklist_withSpecies";
const TOTAL_COUNT: &str = "totalChecklist_byWeekLocation";

fn panel_from_frame(df: &DataFrame) -> Result<Vec<PanelRow>> {
    let names = string_column(df, "common_name")?;
    let counties = string_column(df, "county")?;
    let years = opt_int_column(df, "year")?;
    let weeks = opt_int_column(df, "week")?;
    let species = opt_int_column(df, SPECIES_COUNT)?;
    let totals = opt_int_column(df, TOTAL_COUNT)?;
    let rates = opt_float_column(df, "detection_rate")?;

    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let year = required(years[i], "year")?;
        let week = required(weeks[i], "week")?;
        rows.push(PanelRow {
            common_name: names[i].clone(),
            county: counties[i].clone(),
            year: i32::try_from(year)
                .map_err(|_| BirdcastError::Schema(format!("year {} out of range", year)))?,
            week: u32::try_from(week)
                .map_err(|_| BirdcastError::Schema(format!("week {} out of range", week)))?,
            species_checklists: to_count(species[i], SPECIES_COUNT)?,
            total_checklists: to_count(totals[i], TOTAL_COUNT)?,
            detection_rate: rates[i],
        });
    }
    Ok(rows)
}

fn panel_to_frame(panel: &RollingPanel) -> Result<DataFrame> {
    let rows = panel.rows();
    let df = DataFrame::new(vec![
        Series::new(
            "common_name",
            rows.iter().map(|r| r.common_name.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "county",
            rows.iter().map(|r| r.county.as_str()).collect::<Vec<_>>(),
        ),
        Series::new("year", rows.iter().map(|r| r.year).collect::<Vec<i32>>()),
        Series::new(
            "week",
            rows.iter().map(|r| r.week as i32).collect::<Vec<i32>>(),
        ),
        Series::new(
            SPECIES_COUNT,
            rows.iter()
                .map(|r| r.species_checklists.map(i64::from))
                .collect::<Vec<Option<i64>>>(),
        ),
        Series::new(
            TOTAL_COUNT,
            rows.iter()
                .map(|r| r.total_checklists.map(i64::from))
                .collect::<Vec<Option<i64>>>(),
        ),
        Series::new(
            "detection_rate",
            rows.iter()
                .map(|r| r.detection_rate)
                .collect::<Vec<Option<f64>>>(),
        ),
    ])?;
    Ok(df)
}

/// Load the rolling panel. A missing file is an empty panel.
pub fn read_panel(path: &Path) -> Result<RollingPanel> {
    let format = TableFormat::from_path(path)?;
    if !path.exists() {
        info!(path = %path.display(), "no panel on disk, starting empty");
        return Ok(RollingPanel::new());
    }
    let mut rows = match format {
        TableFormat::Feather => panel_from_frame(&read_ipc(path)?)?,
        TableFormat::Csv => read_csv::<PanelRow>(path)?,
    };
    for r in rows.iter_mut() {
        r.detection_rate = r.detection_rate.filter(|x| x.is_finite());
    }
    info!(path = %path.display(), rows = rows.len(), "panel loaded");
    RollingPanel::from_rows(rows)
}

/// Replace the panel on disk atomically.
pub fn write_panel(path: &Path, panel: &RollingPanel) -> Result<()> {
    match TableFormat::from_path(path)? {
        TableFormat::Feather => {
            let mut df = panel_to_frame(panel)?;
            atomic_write(path, |file| {
                IpcWriter::new(file).finish(&mut df)?;
                Ok(())
            })?;
        }
        TableFormat::Csv => {
            atomic_write(path, |file| {
                let mut wtr = csv::Writer::from_writer(file);
                for row in panel.rows() {
                    wtr.serialize(row)?;
                }
                wtr.flush()?;
                Ok(())
            })?;
        }
    }
    info!(path = %path.display(), rows = panel.len(), "panel written");
    Ok(())
}

/// Load a cleaned observation batch.
pub fn read_observations(path: &Path) -> Result<Vec<Observation>> {
    let records = match TableFormat::from_path(path)? {
        TableFormat::Feather => {
            let df = read_ipc(path)?;
            let checklists = string_column(&df, "checklist_id")?;
            let names = string_column(&df, "common_name")?;
            let counties = string_column(&df, "county")?;
            let dates = date_column(&df, "observation_date")?;
            checklists
                .into_iter()
                .zip(names)
                .zip(counties)
                .zip(dates)
                .map(|(((checklist_id, common_name), county), observation_date)| Observation {
                    checklist_id,
                    common_name,
                    county,
                    observation_date,
                })
                .collect()
        }
        TableFormat::Csv => read_csv::<Observation>(path)?,
    };
    info!(path = %path.display(), records = records.len(), "batch loaded");
    Ok(records)
}
