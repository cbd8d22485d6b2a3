//! Temporal harmonization: rounding onto the elected interval, duplicate
//! consolidation, the complete regular axis, selective half-hour imputation,
//! and the minimum-active-sensor completeness filter.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use tracing::info;

use crate::models::{CadenceLabel, Interval, Reading};

/// Rounds a datetime to the nearest multiple of `interval_min` minutes,
/// half-up on the boundary. Returns the slot key in minutes.
pub fn round_to_slot(dt: NaiveDateTime, interval_min: i64) -> i64 {
    let secs = dt.and_utc().timestamp();
    let step = interval_min * 60;
    (secs + step / 2).div_euclid(step) * interval_min
}

/// Measurements on the regular axis. `series[sensor]` maps slot minutes to
/// the consolidated pm25 value; missing readings are simply absent.
#[derive(Debug)]
pub struct NormalizedTable {
    pub interval: Interval,
    /// Complete regular axis from rounded min to rounded max.
    pub axis: Vec<i64>,
    pub series: Vec<BTreeMap<i64, f64>>,
}

/// Rounds every reading to the elected interval and consolidates duplicate
/// `(sensor, slot)` pairs: first non-missing wins at 30 minutes, hourly mean
/// of non-missing at 60 minutes.
pub fn normalize(readings: &[Reading], n_sensors: usize, interval: Interval) -> NormalizedTable {
    let step = interval.minutes();
    let mut slot_min = i64::MAX;
    let mut slot_max = i64::MIN;
    let mut series: Vec<BTreeMap<i64, f64>> = vec![BTreeMap::new(); n_sensors];
    // Accumulators for the hourly-mean path.
    let mut sums: Vec<BTreeMap<i64, (f64, u32)>> = match interval {
        Interval::SixtyMin => vec![BTreeMap::new(); n_sensors],
        Interval::ThirtyMin => Vec::new(),
    };

    for reading in readings {
        let slot = round_to_slot(reading.datetime, step);
        slot_min = slot_min.min(slot);
        slot_max = slot_max.max(slot);
        let value = match reading.pm25 {
            Some(v) => v,
            None => continue,
        };
        match interval {
            Interval::ThirtyMin => {
                series[reading.sensor as usize].entry(slot).or_insert(value);
            }
            Interval::SixtyMin => {
                let acc = sums[reading.sensor as usize].entry(slot).or_insert((0.0, 0));
                acc.0 += value;
                acc.1 += 1;
            }
        }
    }

    if let Interval::SixtyMin = interval {
        for (sensor, acc) in sums.into_iter().enumerate() {
            for (slot, (sum, count)) in acc {
                series[sensor].insert(slot, sum / count as f64);
            }
        }
    }

    let axis = if slot_min > slot_max {
        Vec::new()
    } else {
        (0..)
            .map(|i| slot_min + i * step)
            .take_while(|&s| s <= slot_max)
            .collect()
    };

    info!(
        "Normalized axis: {} slots of {} minutes",
        axis.len(),
        step
    );
    NormalizedTable {
        interval,
        axis,
        series,
    }
}

/// Fills missing half-hour slots of hourly and mixed sensors with the mean
/// of the two flanking on-hour readings, when both exist. Active only at the
/// 30-minute interval; `Thirty` sensors are never touched. Returns the
/// number of imputed values.
pub fn impute(table: &mut NormalizedTable, labels: &[CadenceLabel]) -> usize {
    if table.interval != Interval::ThirtyMin {
        return 0;
    }
    let mut imputed = 0usize;
    for (sensor, series) in table.series.iter_mut().enumerate() {
        match labels[sensor] {
            CadenceLabel::Hourly | CadenceLabel::Mixed => {}
            _ => continue,
        }
        let mut fills: Vec<(i64, f64)> = Vec::new();
        for &slot in &table.axis {
            if slot.rem_euclid(60) != 30 || series.contains_key(&slot) {
                continue;
            }
            if let (Some(&before), Some(&after)) =
                (series.get(&(slot - 30)), series.get(&(slot + 30)))
            {
                fills.push((slot, (before + after) / 2.0));
            }
        }
        imputed += fills.len();
        series.extend(fills);
    }
    if imputed > 0 {
        info!("Selectively imputed {} half-hour values", imputed);
    }
    imputed
}

/// Active sensor rows at one accepted timestamp.
#[derive(Debug, Clone)]
pub struct SlotActive {
    pub slot_min: i64,
    /// `(sensor index, pm25)` for every sensor with a value at this slot.
    pub rows: Vec<(u32, f64)>,
}

/// Keeps only the timestamps with at least `s_min` active sensors. Returns
/// the accepted slots in axis order and the rejected count.
pub fn filter_complete(table: &NormalizedTable, s_min: usize) -> (Vec<SlotActive>, usize) {
    let mut accepted = Vec::new();
    let mut rejected = 0usize;
    for &slot in &table.axis {
        let rows: Vec<(u32, f64)> = table
            .series
            .iter()
            .enumerate()
            .filter_map(|(sensor, series)| {
                series.get(&slot).map(|&v| (sensor as u32, v))
            })
            .collect();
        if rows.len() >= s_min {
            accepted.push(SlotActive {
                slot_min: slot,
                rows,
            });
        } else {
            rejected += 1;
        }
    }
    info!(
        "Completeness filter: {} timestamps accepted, {} below threshold",
        accepted.len(),
        rejected
    );
    (accepted, rejected)
}
