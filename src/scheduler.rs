//! Parallel per-timestamp scheduling. Each accepted timestamp is one task
//! over immutable shared assets; failures are captured per timestamp and
//! never abort the run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{error, warn};

use crate::aggregate::aggregate_timestamp;
use crate::config::Config;
use crate::distance::distance_rows;
use crate::errors::TaskError;
use crate::grid::SpatialAssets;
use crate::idw::interpolate_timestamp;
use crate::models::{DistanceRow, KelurahanRow, Sensor, TimestampType};
use crate::stata;
use crate::temporal::SlotActive;

/// One unit of work shipped to a worker. A slot can carry several
/// representative tags when active-sensor counts tie.
struct TimestampTask {
    slot: SlotActive,
    representative: Vec<TimestampType>,
}

struct TaskOutput {
    rows: Vec<KelurahanRow>,
    distance_rows: Vec<DistanceRow>,
}

/// Merged scheduler results, deterministically sorted.
pub struct ScheduleOutcome {
    pub rows: Vec<KelurahanRow>,
    pub distance_rows: Vec<DistanceRow>,
    pub failures: Vec<TaskError>,
    pub cancelled: usize,
}

/// Runs IDW + aggregation (+ distance provenance for representative
/// timestamps) across a dedicated worker pool. The cancellation flag drains
/// the pool: running tasks finish, pending ones are skipped and counted.
pub fn run(
    accepted: Vec<SlotActive>,
    representatives: &[(i64, TimestampType)],
    assets: Arc<SpatialAssets>,
    sensors: Arc<Vec<Sensor>>,
    config: &Config,
    cancel: Arc<AtomicBool>,
) -> Result<ScheduleOutcome> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .context("Failed to build the worker pool")?;

    let tasks: Vec<TimestampTask> = accepted
        .into_iter()
        .map(|slot| {
            let representative = representatives
                .iter()
                .filter(|(s, _)| *s == slot.slot_min)
                .map(|&(_, t)| t)
                .collect();
            TimestampTask {
                slot,
                representative,
            }
        })
        .collect();

    let progress = Arc::new(ProgressBar::new(tasks.len() as u64));
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let budget = Duration::from_secs(config.task_timeout_seconds);
    let results: Vec<Option<Result<TaskOutput, TaskError>>> = pool.install(|| {
        tasks
            .into_par_iter()
            .map(|task| {
                if cancel.load(Ordering::Relaxed) {
                    progress.inc(1);
                    return None;
                }
                let result = run_task(task, &assets, &sensors, config, budget);
                progress.inc(1);
                Some(result)
            })
            .collect()
    });
    progress.finish_and_clear();

    let mut rows = Vec::new();
    let mut dist = Vec::new();
    let mut failures = Vec::new();
    let mut cancelled = 0usize;
    for result in results {
        match result {
            None => cancelled += 1,
            Some(Ok(output)) => {
                rows.extend(output.rows);
                dist.extend(output.distance_rows);
            }
            Some(Err(e)) => {
                error!(
                    "Timestamp {} failed: {}",
                    stata::slot_to_datetime(e.slot_min),
                    e.reason
                );
                failures.push(e);
            }
        }
    }
    if cancelled > 0 {
        warn!("Cancellation drained the pool; {} timestamps skipped", cancelled);
    }

    // Deterministic ordering regardless of worker interleaving.
    rows.sort_by(|a, b| {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.kelurahan.cmp(&b.kelurahan))
    });
    dist.sort_by(|a, b| {
        a.base
            .timestamp_ms
            .cmp(&b.base.timestamp_ms)
            .then_with(|| a.base.kelurahan.cmp(&b.base.kelurahan))
            .then_with(|| a.timestamp_type.as_str().cmp(b.timestamp_type.as_str()))
    });

    Ok(ScheduleOutcome {
        rows,
        distance_rows: dist,
        failures,
        cancelled,
    })
}

fn run_task(
    task: TimestampTask,
    assets: &SpatialAssets,
    sensors: &[Sensor],
    config: &Config,
    budget: Duration,
) -> Result<TaskOutput, TaskError> {
    let slot_min = task.slot.slot_min;
    let started = Instant::now();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let timestamp_ms = stata::encode(stata::unix_seconds(stata::slot_to_datetime(slot_min)));
        let predictions = interpolate_timestamp(
            &assets.grid,
            &task.slot.rows,
            sensors,
            config.neighbors,
            config.power,
        );
        let rows = aggregate_timestamp(
            timestamp_ms,
            &predictions,
            assets,
            task.slot.rows.len() as u32,
        );
        let distance = task
            .representative
            .iter()
            .flat_map(|&ttype| distance_rows(&rows, ttype, &predictions, assets, sensors))
            .collect();
        TaskOutput {
            rows,
            distance_rows: distance,
        }
    }));

    let output = match outcome {
        Ok(output) => output,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".into());
            return Err(TaskError {
                slot_min,
                reason: format!("worker crash: {}", reason),
            });
        }
    };

    // Soft budget, a safety net rather than a regular code path.
    let elapsed = started.elapsed();
    if elapsed > budget {
        return Err(TaskError {
            slot_min,
            reason: format!(
                "exceeded soft task budget ({:.1}s > {}s)",
                elapsed.as_secs_f64(),
                budget.as_secs()
            ),
        });
    }

    Ok(output)
}
