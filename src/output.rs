//! Result tables and their writers. Tables go out as CSV or Parquet with
//! the Stata `%tc` timestamp column, named after the neighbor cap and the
//! input date range.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use polars::prelude::*;
use tracing::{info, warn};

use crate::config::OutputFormat;
use crate::errors::EngineError;
use crate::models::{DistanceRow, KelurahanRow};

pub fn results_filename(neighbors: usize, range: &(String, String), format: OutputFormat) -> String {
    format!(
        "jakarta_kelurahan_pm25_nmax{}_{}_to_{}.{}",
        neighbors,
        range.0,
        range.1,
        format.extension()
    )
}

pub fn distances_filename(range: &(String, String), format: OutputFormat) -> String {
    format!(
        "jakarta_kelurahan_distances_{}_to_{}.{}",
        range.0,
        range.1,
        format.extension()
    )
}

pub fn results_dataframe(rows: &[KelurahanRow]) -> Result<DataFrame> {
    let df = df![
        "KELURAHAN_NAME" => rows.iter().map(|r| r.kelurahan.clone()).collect::<Vec<String>>(),
        "timestamp" => rows.iter().map(|r| r.timestamp_ms).collect::<Vec<i64>>(),
        "avg_pm25" => rows.iter().map(|r| r.avg_pm25).collect::<Vec<f64>>(),
        "min_pm25" => rows.iter().map(|r| r.min_pm25).collect::<Vec<f64>>(),
        "max_pm25" => rows.iter().map(|r| r.max_pm25).collect::<Vec<f64>>(),
        "n_grids" => rows.iter().map(|r| r.n_grids).collect::<Vec<u32>>(),
        "n_sensors_used" => rows.iter().map(|r| r.n_sensors_used).collect::<Vec<u32>>(),
        "n_contributing_sensors" => rows.iter().map(|r| r.n_contributing_sensors).collect::<Vec<u32>>(),
    ]?;
    Ok(df)
}

pub fn distances_dataframe(rows: &[DistanceRow]) -> Result<DataFrame> {
    let df = df![
        "KELURAHAN_NAME" => rows.iter().map(|r| r.base.kelurahan.clone()).collect::<Vec<String>>(),
        "timestamp_type" => rows.iter().map(|r| r.timestamp_type.as_str().to_string()).collect::<Vec<String>>(),
        "timestamp" => rows.iter().map(|r| r.base.timestamp_ms).collect::<Vec<i64>>(),
        "avg_pm25" => rows.iter().map(|r| r.base.avg_pm25).collect::<Vec<f64>>(),
        "min_pm25" => rows.iter().map(|r| r.base.min_pm25).collect::<Vec<f64>>(),
        "max_pm25" => rows.iter().map(|r| r.base.max_pm25).collect::<Vec<f64>>(),
        "min_distance" => rows.iter().map(|r| r.min_distance_km).collect::<Vec<f64>>(),
        "median_distance" => rows.iter().map(|r| r.median_distance_km).collect::<Vec<f64>>(),
        "avg_distance" => rows.iter().map(|r| r.avg_distance_km).collect::<Vec<f64>>(),
        "max_distance" => rows.iter().map(|r| r.max_distance_km).collect::<Vec<f64>>(),
        "n_grids" => rows.iter().map(|r| r.base.n_grids).collect::<Vec<u32>>(),
        "n_sensors_used" => rows.iter().map(|r| r.base.n_sensors_used).collect::<Vec<u32>>(),
        "n_contributing_sensors" => rows.iter().map(|r| r.base.n_contributing_sensors).collect::<Vec<u32>>(),
    ]?;
    Ok(df)
}

fn write_frame(df: &mut DataFrame, path: &Path, format: OutputFormat) -> Result<()> {
    let file = File::create(path).map_err(|source| EngineError::OutputIo {
        path: path.to_path_buf(),
        source,
    })?;
    match format {
        OutputFormat::Csv => {
            CsvWriter::new(file)
                .finish(df)
                .with_context(|| format!("Failed to write CSV to {:?}", path))?;
        }
        OutputFormat::Parquet => {
            ParquetWriter::new(file)
                .finish(df)
                .with_context(|| format!("Failed to write Parquet to {:?}", path))?;
        }
    }
    Ok(())
}

/// Writes the table to the output directory; on failure retries once into
/// the OS temporary directory before giving up.
pub fn write_with_fallback(
    df: &mut DataFrame,
    output_dir: &Path,
    filename: &str,
    format: OutputFormat,
) -> Result<PathBuf> {
    let target = output_dir.join(filename);
    match write_frame(df, &target, format) {
        Ok(()) => {
            info!("Wrote {} rows to {:?}", df.height(), target);
            Ok(target)
        }
        Err(first) => {
            let fallback = std::env::temp_dir().join(filename);
            warn!(
                "Write to {:?} failed ({}); retrying in {:?}",
                target, first, fallback
            );
            match write_frame(df, &fallback, format) {
                Ok(()) => {
                    info!("Wrote {} rows to fallback {:?}", df.height(), fallback);
                    Ok(fallback)
                }
                Err(second) => Err(EngineError::OutputRetryExhausted(format!(
                    "{:?}: {}; fallback {:?}: {}",
                    target, first, fallback, second
                ))
                .into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimestampType;

    fn sample_rows() -> Vec<KelurahanRow> {
        vec![
            KelurahanRow {
                kelurahan: "Menteng".into(),
                timestamp_ms: 1_925_078_400_000,
                avg_pm25: 41.5,
                min_pm25: 38.0,
                max_pm25: 45.0,
                n_grids: 12,
                n_sensors_used: 80,
                n_contributing_sensors: 14,
            },
            KelurahanRow {
                kelurahan: "Tebet".into(),
                timestamp_ms: 1_925_078_400_000,
                avg_pm25: 39.0,
                min_pm25: 39.0,
                max_pm25: 39.0,
                n_grids: 1,
                n_sensors_used: 80,
                n_contributing_sensors: 10,
            },
        ]
    }

    #[test]
    fn test_filenames() {
        let range = ("2023-01-01".to_string(), "2023-03-31".to_string());
        assert_eq!(
            results_filename(10, &range, OutputFormat::Csv),
            "jakarta_kelurahan_pm25_nmax10_2023-01-01_to_2023-03-31.csv"
        );
        assert_eq!(
            distances_filename(&range, OutputFormat::Parquet),
            "jakarta_kelurahan_distances_2023-01-01_to_2023-03-31.parquet"
        );
    }

    #[test]
    fn test_results_dataframe_shape() {
        let df = results_dataframe(&sample_rows()).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 8);
        assert_eq!(
            df.get_column_names()[0].as_str(),
            "KELURAHAN_NAME"
        );
    }

    #[test]
    fn test_distances_dataframe_columns() {
        let rows = vec![DistanceRow {
            base: sample_rows().remove(0),
            timestamp_type: TimestampType::MaxSensors,
            min_distance_km: 0.8,
            median_distance_km: 2.1,
            avg_distance_km: 2.4,
            max_distance_km: 6.0,
        }];
        let df = distances_dataframe(&rows).unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(df.width(), 13);
        let names: Vec<&str> = df.get_column_names().iter().map(|s| s.as_str()).collect();
        assert!(names.contains(&"timestamp_type"));
        assert!(names.contains(&"median_distance"));
    }

    #[test]
    fn test_csv_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut df = results_dataframe(&sample_rows()).unwrap();
        let path =
            write_with_fallback(&mut df, dir.path(), "out.csv", OutputFormat::Csv).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("KELURAHAN_NAME,timestamp,avg_pm25"));
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_fallback_to_temp_dir() {
        let mut df = results_dataframe(&sample_rows()).unwrap();
        let missing = Path::new("/nonexistent-output-dir");
        let path = write_with_fallback(&mut df, missing, "fallback_test.csv", OutputFormat::Csv)
            .unwrap();
        assert!(path.starts_with(std::env::temp_dir()));
        std::fs::remove_file(path).ok();
    }
}
