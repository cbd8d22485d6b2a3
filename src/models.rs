use chrono::NaiveDateTime;
use serde::Serialize;

/// A validated sensor station. Position is immutable for the run.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub sensor_id: String,
    pub longitude: f64,
    pub latitude: f64,
}

/// Reporting cadence label per sensor, derived from the fraction of
/// half-hour slots holding a valid reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CadenceLabel {
    Thirty,
    Hourly,
    Mixed,
    Other,
}

/// The single sampling period elected for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    ThirtyMin,
    SixtyMin,
}

impl Interval {
    pub fn minutes(&self) -> i64 {
        match self {
            Interval::ThirtyMin => 30,
            Interval::SixtyMin => 60,
        }
    }
}

/// One raw reading after loading. `pm25` is `None` for the sensor-fault
/// convention (raw 0) and for values above the cap.
#[derive(Debug, Clone)]
pub struct Reading {
    /// Index into the run's sensor table.
    pub sensor: u32,
    pub datetime: NaiveDateTime,
    pub pm25: Option<f64>,
}

/// Per-sensor cadence counts logged after classification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CadenceSummary {
    pub thirty: usize,
    pub hourly: usize,
    pub mixed: usize,
    pub other: usize,
    pub total: usize,
}

/// Which representative timestamp a distance row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    MaxSensors,
    MinSensors,
    MedianSensors,
}

impl TimestampType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampType::MaxSensors => "max_sensors",
            TimestampType::MinSensors => "min_sensors",
            TimestampType::MedianSensors => "median_sensors",
        }
    }
}

/// One kelurahan at one accepted timestamp.
#[derive(Debug, Clone)]
pub struct KelurahanRow {
    pub kelurahan: String,
    pub timestamp_ms: i64,
    pub avg_pm25: f64,
    pub min_pm25: f64,
    pub max_pm25: f64,
    pub n_grids: u32,
    pub n_sensors_used: u32,
    pub n_contributing_sensors: u32,
}

/// A [`KelurahanRow`] extended with sensor-distance provenance, emitted only
/// for the three representative timestamps.
#[derive(Debug, Clone)]
pub struct DistanceRow {
    pub base: KelurahanRow,
    pub timestamp_type: TimestampType,
    pub min_distance_km: f64,
    pub median_distance_km: f64,
    pub avg_distance_km: f64,
    pub max_distance_km: f64,
}

/// Counts of every recoverable drop, surfaced in the final summary. The
/// engine never discards data without attributing it to one of these.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub rows_read: usize,
    pub rows_dropped_bbox: usize,
    pub rows_dropped_bad_datetime: usize,
    pub sensors_excluded: usize,
    pub coordinate_conflicts: usize,
    pub readings_nulled_zero: usize,
    pub readings_nulled_cap: usize,
    pub values_imputed: usize,
    pub timestamps_total: usize,
    pub timestamps_accepted: usize,
    pub timestamps_below_threshold: usize,
    pub timestamps_cancelled: usize,
    pub task_failures: usize,
    pub grid_boundary_ties: usize,
    pub polygons_without_grid: usize,
}
