// src/lib.rs - Library surface for the detection-rate pipeline

pub mod cleaning;
pub mod config;
pub mod core;
pub mod driver;
pub mod io;
pub mod logging;
pub mod panel;
pub mod preprocess;
pub mod worker;

pub use core::{Forecaster, ForecastResult, GrowthType, TimeSeriesData, WeekConvention};
pub use driver::{run_forecasts, write_outputs, BatchReport};
pub use panel::{update_panel, Observation, PanelRow, RollingPanel};
pub use preprocess::{preprocess, ModelRow, ModelTable, SeriesKey};
pub use worker::{run_series, ParamGrid, SeriesForecast};

pub type Result<T> = std::result::Result<T, BirdcastError>;

#[derive(Debug, thiserror::Error)]
pub enum BirdcastError {
    #[error("Data validation error: {0}")]
    DataValidation(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Insufficient data: need at least {needed} observations, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Prediction error: {0}")]
    Prediction(String),

    #[error("Optimization error: {0}")]
    Optimization(String),

    #[error("Cleaning step error: {0}")]
    Cleaning(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Series {species} / {county} failed: {source}")]
    Series {
        species: String,
        county: String,
        #[source]
        source: Box<BirdcastError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
