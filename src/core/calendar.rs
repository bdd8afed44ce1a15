use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// A (year, week) pair under some [`WeekConvention`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WeekKey {
    pub year: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn new(year: i32, week: u32) -> Self {
        Self { year, week }
    }
}

/// Week numbering conventions used by the pipeline.
///
/// Raw observations are bucketed with ISO-8601 calendar weeks, while the model
/// date axis uses positional weeks anchored at January 1st. The two disagree
/// around year boundaries, so every conversion names the convention it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekConvention {
    /// ISO-8601 weeks: Monday start, week 1 contains the first Thursday.
    Iso,
    /// Week 1 starts on Jan 1; week n starts (n - 1) * 7 days later.
    JanFirst,
}

impl WeekConvention {
    pub fn week_of(self, date: NaiveDate) -> WeekKey {
        match self {
            WeekConvention::Iso => {
                let iso = date.iso_week();
                WeekKey::new(iso.year(), iso.week())
            }
            WeekConvention::JanFirst => WeekKey::new(date.year(), dt_to_week_number(date)),
        }
    }

    /// First day of the given week, or `None` if the key does not exist.
    pub fn start_of(self, key: WeekKey) -> Option<NaiveDate> {
        match self {
            WeekConvention::Iso => NaiveDate::from_isoywd_opt(key.year, key.week, Weekday::Mon),
            WeekConvention::JanFirst => {
                if key.week == 0 || key.week > 53 {
                    return None;
                }
                week_year_to_dt(key.week, key.year)
            }
        }
    }

    pub fn weeks_in_year(self, year: i32) -> u32 {
        match self {
            WeekConvention::Iso => iso_weeks_in_year(year),
            // Dec 30/31 always land in positional week 53
            WeekConvention::JanFirst => 53,
        }
    }
}

/// Start date of `week` in `year` under the Jan-1 convention.
///
/// Jan 1 of `year` plus `(week - 1) * 7` days. This is a positional convention
/// for building the model date axis, not an ISO week.
pub fn week_year_to_dt(week: u32, year: i32) -> Option<NaiveDate> {
    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;
    jan1.checked_add_signed(Duration::days((week as i64 - 1) * 7))
}

/// Week number of `dt` under the Jan-1 convention.
///
/// Whole days since Jan 1, divided by 7 (floored), plus one. Exact inverse of
/// [`week_year_to_dt`] only for dates it produced.
pub fn dt_to_week_number(dt: NaiveDate) -> u32 {
    dt.ordinal0() / 7 + 1
}

/// Number of ISO weeks (52 or 53) in an ISO year.
pub fn iso_weeks_in_year(year: i32) -> u32 {
    // Dec 28 always falls in the last ISO week of its year
    NaiveDate::from_ymd_opt(year, 12, 28)
        .map(|d| d.iso_week().week())
        .unwrap_or(52)
}
