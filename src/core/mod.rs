pub mod calendar; // Week numbering conventions
pub mod data;
pub mod diagnostics; // Rolling-origin cross-validation and metrics
pub mod model;
pub mod optimizer; // MAP fit using argmin L-BFGS
pub mod seasonality;
pub mod trend;

pub use calendar::{dt_to_week_number, week_year_to_dt, WeekConvention, WeekKey};
pub use data::{ForecastResult, TimeSeriesData};
pub use model::{Forecaster, Frequency, GrowthType};
