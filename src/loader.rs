use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::EngineError;
use crate::models::{Reading, RunSummary, Sensor};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Deserialize)]
struct RawMeasurementRecord {
    sensor_id: String,
    longitude: Option<f64>,
    latitude: Option<f64>,
    datetime: String,
    pm25: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawStationRecord {
    sensor_id: String,
    longitude: Option<f64>,
    latitude: Option<f64>,
}

/// Validated measurements plus the run's sensor table.
#[derive(Debug)]
pub struct LoadedData {
    pub sensors: Vec<Sensor>,
    pub readings: Vec<Reading>,
    /// `{start}_to_{end}` suffix for output filenames.
    pub date_range: (String, String),
}

/// Reads and validates the prepared measurement table. If `station_path` is
/// given it is authoritative for sensor positions and the coordinate columns
/// of the measurement table are ignored.
pub fn load(
    measurement_path: &Path,
    station_path: Option<&Path>,
    config: &Config,
    summary: &mut RunSummary,
) -> Result<LoadedData> {
    let station_coords = match station_path {
        Some(path) => Some(read_station_table(path, summary)?),
        None => None,
    };

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(measurement_path)
        .with_context(|| format!("Failed to open measurement table {:?}", measurement_path))?;

    check_required_columns(&mut rdr, measurement_path)?;

    // First pass over records: establish per-sensor coordinates (first
    // non-null wins) and collect raw readings keyed by sensor id.
    let mut coords: HashMap<String, (f64, f64)> = HashMap::new();
    let mut conflict_logged: HashMap<String, bool> = HashMap::new();
    let mut raw_rows: Vec<(String, NaiveDateTime, Option<f64>)> = Vec::new();
    let mut datetime_failures = 0usize;
    let mut record_failures = 0usize;

    for result in rdr.deserialize::<RawMeasurementRecord>() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                record_failures += 1;
                if record_failures <= 5 {
                    warn!("Skipping unparseable measurement row: {}", e);
                }
                continue;
            }
        };
        summary.rows_read += 1;

        let datetime = match parse_datetime(&record.datetime) {
            Some(dt) => dt,
            None => {
                datetime_failures += 1;
                summary.rows_dropped_bad_datetime += 1;
                continue;
            }
        };

        if station_coords.is_none() {
            if let (Some(lon), Some(lat)) = (record.longitude, record.latitude) {
                if lon.is_finite() && lat.is_finite() {
                    match coords.get(&record.sensor_id) {
                        None => {
                            coords.insert(record.sensor_id.clone(), (lon, lat));
                        }
                        Some(&(lon0, lat0)) => {
                            if (lon0 - lon).abs() > 1e-9 || (lat0 - lat).abs() > 1e-9 {
                                summary.coordinate_conflicts += 1;
                                let seen = conflict_logged
                                    .entry(record.sensor_id.clone())
                                    .or_insert(false);
                                if !*seen {
                                    warn!(
                                        "Sensor {} has conflicting coordinates ({}, {}) vs ({}, {}); keeping the first",
                                        record.sensor_id, lon0, lat0, lon, lat
                                    );
                                    *seen = true;
                                }
                            }
                        }
                    }
                }
            }
        }

        let pm25 = normalize_pm25(record.pm25, config.pm25_cap, summary);
        raw_rows.push((record.sensor_id, datetime, pm25));
    }

    if raw_rows.is_empty() {
        return Err(EngineError::InputShape(format!(
            "no parseable rows in {:?} ({} datetime failures, {} record failures)",
            measurement_path, datetime_failures, record_failures
        ))
        .into());
    }
    let position_source: &HashMap<String, (f64, f64)> = match &station_coords {
        Some(stations) => stations,
        None => &coords,
    };

    // Keep only sensors with finite coordinates inside the bounding box.
    // Coordinates are never imputed.
    let mut sensors: Vec<Sensor> = Vec::new();
    let mut sensor_index: HashMap<String, u32> = HashMap::new();
    let mut excluded: Vec<String> = Vec::new();
    let mut seen_order: Vec<&String> = Vec::new();
    let mut seen: HashSet<&String> = HashSet::new();
    for (id, _, _) in &raw_rows {
        if seen.insert(id) {
            seen_order.push(id);
        }
    }
    for id in seen_order {
        match position_source.get(id) {
            Some(&(lon, lat)) if config.bbox.contains(lon, lat) => {
                sensor_index.insert(id.clone(), sensors.len() as u32);
                sensors.push(Sensor {
                    sensor_id: id.clone(),
                    longitude: lon,
                    latitude: lat,
                });
            }
            _ => excluded.push(id.clone()),
        }
    }
    summary.sensors_excluded = excluded.len();
    if !excluded.is_empty() {
        info!(
            "Excluded {} sensors with missing or out-of-box coordinates: {:?}",
            excluded.len(),
            &excluded[..excluded.len().min(10)]
        );
    }

    let mut readings: Vec<Reading> = Vec::with_capacity(raw_rows.len());
    for (id, datetime, pm25) in raw_rows {
        match sensor_index.get(&id) {
            Some(&idx) => readings.push(Reading {
                sensor: idx,
                datetime,
                pm25,
            }),
            None => summary.rows_dropped_bbox += 1,
        }
    }

    if readings.is_empty() || sensors.is_empty() {
        return Err(EngineError::InputShape(
            "no measurements left after coordinate validation".into(),
        )
        .into());
    }

    let date_range = extract_date_range(measurement_path).unwrap_or_else(|| {
        let min = readings.iter().map(|r| r.datetime).min().unwrap();
        let max = readings.iter().map(|r| r.datetime).max().unwrap();
        let range = (
            min.format("%Y-%m-%d").to_string(),
            max.format("%Y-%m-%d").to_string(),
        );
        warn!(
            "Input filename carries no date range; using data range {}_to_{}",
            range.0, range.1
        );
        range
    });

    info!(
        "Loaded {} readings from {} sensors ({} rows dropped by bbox, {} bad datetimes)",
        readings.len(),
        sensors.len(),
        summary.rows_dropped_bbox,
        summary.rows_dropped_bad_datetime
    );

    Ok(LoadedData {
        sensors,
        readings,
        date_range,
    })
}

fn check_required_columns(
    rdr: &mut csv::Reader<std::fs::File>,
    path: &Path,
) -> Result<()> {
    let headers = rdr
        .headers()
        .with_context(|| format!("Failed to read CSV headers from {:?}", path))?;
    let present: Vec<&str> = headers.iter().collect();
    let missing: Vec<&str> = ["sensor_id", "longitude", "latitude", "datetime", "pm25"]
        .iter()
        .filter(|c| !present.contains(*c))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::InputShape(format!(
            "measurement table {:?} is missing required columns {:?}",
            path, missing
        ))
        .into());
    }
    Ok(())
}

fn read_station_table(path: &Path, summary: &mut RunSummary) -> Result<HashMap<String, (f64, f64)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open station table {:?}", path))?;

    let mut coords: HashMap<String, (f64, f64)> = HashMap::new();
    for result in rdr.deserialize::<RawStationRecord>() {
        let record = result.with_context(|| format!("Bad row in station table {:?}", path))?;
        if let (Some(lon), Some(lat)) = (record.longitude, record.latitude) {
            if !lon.is_finite() || !lat.is_finite() {
                continue;
            }
            match coords.get(&record.sensor_id) {
                None => {
                    coords.insert(record.sensor_id, (lon, lat));
                }
                Some(&(lon0, lat0)) => {
                    if (lon0 - lon).abs() > 1e-9 || (lat0 - lat).abs() > 1e-9 {
                        summary.coordinate_conflicts += 1;
                        warn!(
                            "Station table lists sensor {} twice with different coordinates; keeping the first",
                            record.sensor_id
                        );
                    }
                }
            }
        }
    }
    info!("Station table provides coordinates for {} sensors", coords.len());
    Ok(coords)
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn normalize_pm25(raw: Option<f64>, cap: f64, summary: &mut RunSummary) -> Option<f64> {
    match raw {
        Some(v) if !v.is_finite() || v <= 0.0 => {
            summary.readings_nulled_zero += 1;
            None
        }
        Some(v) if v > cap => {
            summary.readings_nulled_cap += 1;
            None
        }
        other => other,
    }
}

/// Pulls the `{YYYY-MM-DD}_to_{YYYY-MM-DD}` substring out of the input
/// filename, used to suffix output files.
pub fn extract_date_range(path: &Path) -> Option<(String, String)> {
    let name = path.file_name()?.to_string_lossy();
    let re = Regex::new(r"(\d{4}-\d{2}-\d{2})_to_(\d{4}-\d{2}-\d{2})").unwrap();
    let caps = re.captures(&name)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunSummary;
    use std::io::Write;

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new()
            .suffix(".csv")
            .tempfile()
            .unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_extract_date_range() {
        let path = Path::new("/data/master_frame_2023-01-01_to_2023-03-31.csv");
        let (start, end) = extract_date_range(path).unwrap();
        assert_eq!(start, "2023-01-01");
        assert_eq!(end, "2023-03-31");
        assert!(extract_date_range(Path::new("/data/master.csv")).is_none());
    }

    #[test]
    fn test_bbox_filter_and_missing_rules() {
        let file = write_csv(
            "sensor_id,longitude,latitude,datetime,pm25\n\
             A,106.8,-6.2,2023-01-01 10:00:00,35.0\n\
             A,106.8,-6.2,2023-01-01 10:30:00,0\n\
             A,106.8,-6.2,2023-01-01 11:00:00,900.0\n\
             B,20.0,50.0,2023-01-01 10:00:00,12.0\n",
        );
        let mut summary = RunSummary::default();
        let loaded = load(file.path(), None, &Config::default(), &mut summary).unwrap();

        // B is outside the box; its row drops with a count.
        assert_eq!(loaded.sensors.len(), 1);
        assert_eq!(loaded.sensors[0].sensor_id, "A");
        assert_eq!(summary.rows_dropped_bbox, 1);

        // 0 and >cap become missing, the rows themselves survive.
        assert_eq!(loaded.readings.len(), 3);
        assert_eq!(summary.readings_nulled_zero, 1);
        assert_eq!(summary.readings_nulled_cap, 1);
        assert_eq!(loaded.readings[0].pm25, Some(35.0));
        assert_eq!(loaded.readings[1].pm25, None);
        assert_eq!(loaded.readings[2].pm25, None);
    }

    #[test]
    fn test_first_nonnull_coordinate_wins() {
        let file = write_csv(
            "sensor_id,longitude,latitude,datetime,pm25\n\
             A,,,2023-01-01 10:00:00,10.0\n\
             A,106.8,-6.2,2023-01-01 10:30:00,11.0\n\
             A,106.9,-6.3,2023-01-01 11:00:00,12.0\n",
        );
        let mut summary = RunSummary::default();
        let loaded = load(file.path(), None, &Config::default(), &mut summary).unwrap();
        assert_eq!(loaded.sensors[0].longitude, 106.8);
        assert_eq!(loaded.sensors[0].latitude, -6.2);
        assert_eq!(summary.coordinate_conflicts, 1);
        assert_eq!(loaded.readings.len(), 3);
    }

    #[test]
    fn test_station_table_is_authoritative() {
        let measurements = write_csv(
            "sensor_id,longitude,latitude,datetime,pm25\n\
             A,1.0,1.0,2023-01-01 10:00:00,10.0\n",
        );
        let stations = write_csv("sensor_id,longitude,latitude\nA,106.75,-6.15\n");
        let mut summary = RunSummary::default();
        let loaded = load(
            measurements.path(),
            Some(stations.path()),
            &Config::default(),
            &mut summary,
        )
        .unwrap();
        assert_eq!(loaded.sensors[0].longitude, 106.75);
        assert_eq!(loaded.sensors[0].latitude, -6.15);
    }

    #[test]
    fn test_empty_after_validation_is_fatal() {
        let file = write_csv(
            "sensor_id,longitude,latitude,datetime,pm25\n\
             B,20.0,50.0,2023-01-01 10:00:00,12.0\n",
        );
        let mut summary = RunSummary::default();
        assert!(load(file.path(), None, &Config::default(), &mut summary).is_err());
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let file = write_csv("sensor_id,longitude,latitude,when\nA,106.8,-6.2,x\n");
        let mut summary = RunSummary::default();
        let err = load(file.path(), None, &Config::default(), &mut summary)
            .unwrap_err()
            .to_string();
        assert!(err.contains("missing required columns"), "{}", err);
    }
}
