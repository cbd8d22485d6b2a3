use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Resolution of a tie between 30-minute and hourly sensor majorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum IntervalTiePolicy {
    /// Elect the 60-minute interval on a tie (fewer imputed points).
    #[value(name = "prefer-hourly")]
    PreferHourly,
    /// Elect the 30-minute interval on a tie.
    #[value(name = "prefer-30min")]
    Prefer30min,
}

impl std::fmt::Display for IntervalTiePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IntervalTiePolicy::PreferHourly => "prefer-hourly",
            IntervalTiePolicy::Prefer30min => "prefer-30min",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Geographic validity window for sensor coordinates, WGS84 degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
}

impl BoundingBox {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon.is_finite()
            && lat.is_finite()
            && lon >= self.lon_min
            && lon <= self.lon_max
            && lat >= self.lat_min
            && lat <= self.lat_max
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        // Greater Jakarta
        Self {
            lon_min: 106.0,
            lon_max: 107.0,
            lat_min: -7.0,
            lat_max: -5.4,
        }
    }
}

/// Engine parameters. Flows into every stage explicitly; there is no
/// process-wide configuration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Minimum active sensors for a timestamp to be interpolated.
    pub s_min: usize,
    /// IDW neighbor cap (k).
    pub neighbors: usize,
    /// IDW power (p).
    pub power: f64,
    /// Grid spacing in degrees.
    pub cell_size_deg: f64,
    pub bbox: BoundingBox,
    /// Readings above this are treated as missing.
    pub pm25_cap: f64,
    pub interval_tie_policy: IntervalTiePolicy,
    /// Worker threads for the per-timestamp pool.
    pub workers: usize,
    /// Soft per-task budget; an exceeding task fails its timestamp.
    pub task_timeout_seconds: u64,
    pub output_format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            s_min: 50,
            neighbors: 10,
            power: 2.0,
            cell_size_deg: 0.005,
            bbox: BoundingBox::default(),
            pm25_cap: 500.0,
            interval_tie_policy: IntervalTiePolicy::PreferHourly,
            workers: num_cpus::get().saturating_sub(1).max(1),
            task_timeout_seconds: 60,
            output_format: OutputFormat::Csv,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.s_min == 0 {
            return Err(EngineError::Config("s_min must be at least 1".into()));
        }
        if self.neighbors == 0 {
            return Err(EngineError::Config("neighbors must be at least 1".into()));
        }
        if !(self.power > 0.0) {
            return Err(EngineError::Config(format!(
                "power must be positive, got {}",
                self.power
            )));
        }
        if !(self.cell_size_deg > 0.0) {
            return Err(EngineError::Config(format!(
                "cell_size_deg must be positive, got {}",
                self.cell_size_deg
            )));
        }
        if !(self.pm25_cap > 0.0) {
            return Err(EngineError::Config(format!(
                "pm25_cap must be positive, got {}",
                self.pm25_cap
            )));
        }
        let b = &self.bbox;
        if !(b.lon_min < b.lon_max && b.lat_min < b.lat_max) {
            return Err(EngineError::Config(format!(
                "bounding box is degenerate: ({}, {}, {}, {})",
                b.lon_min, b.lon_max, b.lat_min, b.lat_max
            )));
        }
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if self.task_timeout_seconds == 0 {
            return Err(EngineError::Config(
                "task_timeout_seconds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
