//! Tracing subscriber setup for the binary.
//!
//! The library only emits `tracing` events; nothing is printed unless a
//! subscriber is installed. `RUST_LOG` takes precedence over the configured
//! level, e.g.
//!
//! ```bash
//! # Per-fit detail from the worker, info elsewhere
//! RUST_LOG=info,birdcast::worker=debug birdcast forecast
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable format with colors
    #[default]
    Pretty,
    /// JSON lines
    Json,
    /// Compact single-line format
    Compact,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Also write JSON logs to this file.
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            log_file: None,
        }
    }
}

/// Filter from `RUST_LOG`, else `override_level`, else the configured level.
///
/// The optimizer's own crate is capped at warn.
pub fn build_filter(config: &LogConfig, override_level: Option<&str>) -> EnvFilter {
    let directive = override_level.unwrap_or(&config.level);
    let fallback = || {
        let filter = EnvFilter::new(directive);
        match "argmin=warn".parse() {
            Ok(d) => filter.add_directive(d),
            Err(_) => filter,
        }
    };
    match override_level {
        Some(_) => fallback(),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(
    config: &LogConfig,
    override_level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = build_filter(config, override_level);

    if let Some(ref path) = config.log_file {
        // File and stdout share the JSON formatter
        let file = std::sync::Mutex::new(std::fs::File::create(path)?);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .with(fmt::layer().with_writer(file).with_ansi(false).json())
            .try_init()?;
        return Ok(());
    }

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()?,
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()?,
    }
    Ok(())
}
