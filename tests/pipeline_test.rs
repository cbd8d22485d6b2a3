//! End-to-end scenarios over synthetic sensor data: the stages are composed
//! exactly as the orchestrator composes them, with polygons built in memory.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use geo::{LineString, MultiPolygon, Polygon};

use jakarta_pm25::cadence;
use jakarta_pm25::config::{Config, IntervalTiePolicy, OutputFormat};
use jakarta_pm25::distance::select_representatives;
use jakarta_pm25::grid::{build_grid, Kelurahan};
use jakarta_pm25::loader;
use jakarta_pm25::models::{Interval, RunSummary};
use jakarta_pm25::output;
use jakarta_pm25::scheduler;
use jakarta_pm25::temporal;

fn square_kelurahan(min_lon: f64, min_lat: f64, side: f64, name: &str) -> Kelurahan {
    let exterior = LineString::from(vec![
        (min_lon, min_lat),
        (min_lon + side, min_lat),
        (min_lon + side, min_lat + side),
        (min_lon, min_lat + side),
        (min_lon, min_lat),
    ]);
    Kelurahan {
        name: name.to_string(),
        geometry: MultiPolygon::new(vec![Polygon::new(exterior, Vec::new())]),
    }
}

fn write_csv(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new()
        .prefix("measurements_2023-01-01_to_2023-01-02_")
        .suffix(".csv")
        .tempfile()
        .unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f
}

fn test_config(s_min: usize, workers: usize) -> Config {
    Config {
        s_min,
        neighbors: 10,
        workers,
        ..Config::default()
    }
}

/// Three half-hourly sensors in one polygon, five accepted timestamps:
/// every stage runs, the output table lands on disk sorted and complete.
#[test]
fn full_run_over_single_polygon() {
    let mut csv = String::from("sensor_id,longitude,latitude,datetime,pm25\n");
    let coords = [(106.805, -6.195), (106.815, -6.185), (106.810, -6.190)];
    for (i, (lon, lat)) in coords.iter().enumerate() {
        for half_hour in 0..5 {
            let minute = (half_hour % 2) * 30;
            let hour = 10 + half_hour / 2;
            csv.push_str(&format!(
                "S{},{},{},2023-01-01 {:02}:{:02}:00,{}\n",
                i,
                lon,
                lat,
                hour,
                minute,
                10.0 + 10.0 * i as f64
            ));
        }
    }

    let file = write_csv(&csv);
    let config = test_config(3, 2);
    let mut summary = RunSummary::default();
    let loaded = loader::load(file.path(), None, &config, &mut summary).unwrap();
    assert_eq!(loaded.date_range.0, "2023-01-01");

    let (labels, cadence_summary) = cadence::classify(&loaded.readings, loaded.sensors.len());
    let interval = cadence::elect_interval(&cadence_summary, config.interval_tie_policy);
    assert_eq!(interval, Interval::ThirtyMin);

    let mut table = temporal::normalize(&loaded.readings, loaded.sensors.len(), interval);
    temporal::impute(&mut table, &labels);
    let (accepted, rejected) = temporal::filter_complete(&table, config.s_min);
    assert_eq!(accepted.len(), 5);
    assert_eq!(rejected, 0);

    let assets = Arc::new(
        build_grid(
            vec![square_kelurahan(106.80, -6.20, 0.02, "Tebet")],
            config.cell_size_deg,
            &mut summary,
        )
        .unwrap(),
    );
    let representatives = select_representatives(&accepted);
    assert_eq!(representatives.len(), 3);

    let sensors = Arc::new(loaded.sensors);
    let outcome = scheduler::run(
        accepted,
        &representatives,
        Arc::clone(&assets),
        Arc::clone(&sensors),
        &config,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.rows.len(), 5);
    for row in &outcome.rows {
        assert_eq!(row.kelurahan, "Tebet");
        assert_eq!(row.n_sensors_used, 3);
        assert!(row.n_contributing_sensors <= row.n_sensors_used);
        assert!(row.min_pm25 <= row.avg_pm25 && row.avg_pm25 <= row.max_pm25);
        // All predictions stay inside the sensor value hull.
        assert!(row.min_pm25 >= 10.0 - 1e-9 && row.max_pm25 <= 30.0 + 1e-9);
    }
    // Three representative tags with all count ties resolved to one slot.
    assert_eq!(outcome.distance_rows.len(), 3);

    let dir = tempfile::tempdir().unwrap();
    let mut df = output::results_dataframe(&outcome.rows).unwrap();
    let path = output::write_with_fallback(
        &mut df,
        dir.path(),
        &output::results_filename(config.neighbors, &loaded.date_range, OutputFormat::Csv),
        OutputFormat::Csv,
    )
    .unwrap();
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("jakarta_kelurahan_pm25_nmax10_2023-01-01_to_2023-01-02"));
    let content = std::fs::read_to_string(path).unwrap();
    assert_eq!(content.lines().count(), 6);
}

/// Timestamps below the active-sensor threshold disappear before
/// interpolation and are counted once.
#[test]
fn threshold_drops_underpopulated_timestamps() {
    let file = write_csv(
        "sensor_id,longitude,latitude,datetime,pm25\n\
         A,106.805,-6.195,2023-01-01 10:00:00,10.0\n\
         B,106.815,-6.185,2023-01-01 10:00:00,20.0\n\
         A,106.805,-6.195,2023-01-01 10:30:00,12.0\n",
    );
    let config = test_config(2, 1);
    let mut summary = RunSummary::default();
    let loaded = loader::load(file.path(), None, &config, &mut summary).unwrap();

    let table = temporal::normalize(&loaded.readings, loaded.sensors.len(), Interval::ThirtyMin);
    let (accepted, rejected) = temporal::filter_complete(&table, config.s_min);
    assert_eq!(accepted.len(), 1);
    assert_eq!(rejected, 1);
    assert_eq!(accepted[0].rows.len(), 2);
}

/// A 5-vs-5 thirty/hourly tie elects 60 minutes; half-hour readings fold
/// into the adjacent hour by mean and nothing is imputed.
#[test]
fn cadence_tie_elects_hourly_aggregation() {
    let mut csv = String::from("sensor_id,longitude,latitude,datetime,pm25\n");
    for i in 0..5 {
        // Half-hourly reporters.
        for step in 0..8 {
            let hour = 10 + step / 2;
            let minute = (step % 2) * 30;
            csv.push_str(&format!(
                "T{},106.8{},-6.19,2023-01-01 {:02}:{:02}:00,20.0\n",
                i, i, hour, minute
            ));
        }
        // Hourly reporters.
        for hour in 10..14 {
            csv.push_str(&format!(
                "H{},106.8{},-6.18,2023-01-01 {}:00:00,30.0\n",
                i, i, hour
            ));
        }
    }

    let file = write_csv(&csv);
    let config = test_config(1, 1);
    let mut summary = RunSummary::default();
    let loaded = loader::load(file.path(), None, &config, &mut summary).unwrap();

    let (labels, cadence_summary) = cadence::classify(&loaded.readings, loaded.sensors.len());
    assert_eq!(cadence_summary.thirty, 5);
    assert_eq!(cadence_summary.hourly, 5);

    let interval = cadence::elect_interval(&cadence_summary, IntervalTiePolicy::PreferHourly);
    assert_eq!(interval, Interval::SixtyMin);

    let mut table = temporal::normalize(&loaded.readings, loaded.sensors.len(), interval);
    assert_eq!(temporal::impute(&mut table, &labels), 0);

    // A half-hourly sensor's 10:30 reading rounds into the 11:00 slot and
    // averages with the 11:00 reading.
    let t0 = loaded
        .sensors
        .iter()
        .position(|s| s.sensor_id == "T0")
        .unwrap();
    let eleven = temporal::round_to_slot(
        chrono::NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(11, 0, 0)
            .unwrap(),
        60,
    );
    assert_eq!(table.series[t0].get(&eleven), Some(&20.0));
}

/// Two identical runs produce identical tables (canonical sort included).
#[test]
fn determinism_across_runs() {
    let mut csv = String::from("sensor_id,longitude,latitude,datetime,pm25\n");
    for i in 0..6 {
        for half_hour in 0..4 {
            let hour = 9 + half_hour / 2;
            let minute = (half_hour % 2) * 30;
            csv.push_str(&format!(
                "S{},{},{},2023-01-01 {:02}:{:02}:00,{}\n",
                i,
                106.801 + 0.003 * i as f64,
                -6.199 + 0.003 * i as f64,
                hour,
                minute,
                15.0 + 7.0 * i as f64
            ));
        }
    }
    let file = write_csv(&csv);
    let config = test_config(6, 3);

    let run_once = || {
        let mut summary = RunSummary::default();
        let loaded = loader::load(file.path(), None, &config, &mut summary).unwrap();
        let (labels, cadence_summary) =
            cadence::classify(&loaded.readings, loaded.sensors.len());
        let interval = cadence::elect_interval(&cadence_summary, config.interval_tie_policy);
        let mut table = temporal::normalize(&loaded.readings, loaded.sensors.len(), interval);
        temporal::impute(&mut table, &labels);
        let (accepted, _) = temporal::filter_complete(&table, config.s_min);
        let assets = Arc::new(
            build_grid(
                vec![
                    square_kelurahan(106.80, -6.20, 0.01, "West"),
                    square_kelurahan(106.81, -6.19, 0.01, "East"),
                ],
                config.cell_size_deg,
                &mut summary,
            )
            .unwrap(),
        );
        let representatives = select_representatives(&accepted);
        scheduler::run(
            accepted,
            &representatives,
            assets,
            Arc::new(loaded.sensors),
            &config,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    };

    let first = run_once();
    let second = run_once();
    assert_eq!(first.rows.len(), second.rows.len());
    for (a, b) in first.rows.iter().zip(second.rows.iter()) {
        assert_eq!(a.kelurahan, b.kelurahan);
        assert_eq!(a.timestamp_ms, b.timestamp_ms);
        assert_eq!(a.avg_pm25.to_bits(), b.avg_pm25.to_bits());
        assert_eq!(a.min_pm25.to_bits(), b.min_pm25.to_bits());
        assert_eq!(a.max_pm25.to_bits(), b.max_pm25.to_bits());
        assert_eq!(a.n_contributing_sensors, b.n_contributing_sensors);
    }
}
