//! End-to-end orchestration: every stage in dependency order, all I/O on
//! this thread, compute fanned out by the scheduler.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{info, warn};

use crate::cadence;
use crate::config::Config;
use crate::distance::select_representatives;
use crate::errors::EngineError;
use crate::grid;
use crate::loader;
use crate::models::RunSummary;
use crate::output;
use crate::scheduler;
use crate::temporal;

pub struct PipelineOptions {
    pub input: PathBuf,
    pub shapefile: PathBuf,
    pub output_dir: PathBuf,
    pub stations: Option<PathBuf>,
    pub config: Config,
}

pub struct PipelineReport {
    pub summary: RunSummary,
    pub results_path: PathBuf,
    pub distances_path: PathBuf,
    pub result_rows: usize,
}

pub fn run_pipeline(opts: &PipelineOptions, cancel: Arc<AtomicBool>) -> Result<PipelineReport> {
    let started = Instant::now();
    opts.config.validate()?;
    let mut summary = RunSummary::default();

    let loaded = loader::load(
        &opts.input,
        opts.stations.as_deref(),
        &opts.config,
        &mut summary,
    )?;

    let (labels, cadence_summary) = cadence::classify(&loaded.readings, loaded.sensors.len());
    let interval = cadence::elect_interval(&cadence_summary, opts.config.interval_tie_policy);

    let mut table = temporal::normalize(&loaded.readings, loaded.sensors.len(), interval);
    summary.values_imputed = temporal::impute(&mut table, &labels);
    summary.timestamps_total = table.axis.len();

    let (accepted, rejected) = temporal::filter_complete(&table, opts.config.s_min);
    summary.timestamps_accepted = accepted.len();
    summary.timestamps_below_threshold = rejected;
    if accepted.is_empty() {
        return Err(EngineError::InputShape(format!(
            "no timestamp reaches {} active sensors; nothing to interpolate",
            opts.config.s_min
        ))
        .into());
    }

    let kelurahan = grid::load_shapefile(&opts.shapefile)?;
    let assets = Arc::new(grid::build_grid(
        kelurahan,
        opts.config.cell_size_deg,
        &mut summary,
    )?);

    let representatives = select_representatives(&accepted);
    let sensors = Arc::new(loaded.sensors);
    let outcome = scheduler::run(
        accepted,
        &representatives,
        Arc::clone(&assets),
        Arc::clone(&sensors),
        &opts.config,
        cancel,
    )?;
    summary.task_failures = outcome.failures.len();
    summary.timestamps_cancelled = outcome.cancelled;

    let mut results_df = output::results_dataframe(&outcome.rows)?;
    let results_path = output::write_with_fallback(
        &mut results_df,
        &opts.output_dir,
        &output::results_filename(
            opts.config.neighbors,
            &loaded.date_range,
            opts.config.output_format,
        ),
        opts.config.output_format,
    )?;

    let mut distances_df = output::distances_dataframe(&outcome.distance_rows)?;
    let distances_path = output::write_with_fallback(
        &mut distances_df,
        &opts.output_dir,
        &output::distances_filename(&loaded.date_range, opts.config.output_format),
        opts.config.output_format,
    )?;

    log_summary(&summary, started.elapsed().as_secs_f64());

    Ok(PipelineReport {
        summary,
        results_path,
        distances_path,
        result_rows: outcome.rows.len(),
    })
}

fn log_summary(summary: &RunSummary, elapsed_secs: f64) {
    info!("--- Run summary ---");
    info!(
        "Rows read: {} (dropped: {} bbox, {} bad datetime)",
        summary.rows_read, summary.rows_dropped_bbox, summary.rows_dropped_bad_datetime
    );
    info!(
        "Sensors excluded: {} (coordinate conflicts: {})",
        summary.sensors_excluded, summary.coordinate_conflicts
    );
    info!(
        "Readings treated as missing: {} zero-convention, {} above cap",
        summary.readings_nulled_zero, summary.readings_nulled_cap
    );
    info!("Half-hour values imputed: {}", summary.values_imputed);
    info!(
        "Timestamps: {} total, {} accepted, {} below threshold",
        summary.timestamps_total, summary.timestamps_accepted, summary.timestamps_below_threshold
    );
    info!(
        "Grid: {} boundary ties, {} polygons without grid points",
        summary.grid_boundary_ties, summary.polygons_without_grid
    );
    if summary.task_failures > 0 || summary.timestamps_cancelled > 0 {
        warn!(
            "Task failures: {}, cancelled: {}",
            summary.task_failures, summary.timestamps_cancelled
        );
    }
    info!("Finished in {:.1}s", elapsed_secs);
}
