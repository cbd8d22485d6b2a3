//! Representative-timestamp selection and great-circle distance provenance.

use tracing::info;

use crate::grid::SpatialAssets;
use crate::idw::GridPrediction;
use crate::models::{DistanceRow, KelurahanRow, Sensor, TimestampType};
use crate::temporal::SlotActive;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// The three representative slots: maximum, minimum, and upper-median
/// active-sensor count over the accepted set. Ties on count resolve to the
/// earliest slot for determinism.
pub fn select_representatives(accepted: &[SlotActive]) -> Vec<(i64, TimestampType)> {
    assert!(!accepted.is_empty(), "no accepted timestamps");

    let mut by_count: Vec<(usize, i64)> = accepted
        .iter()
        .map(|s| (s.rows.len(), s.slot_min))
        .collect();
    by_count.sort_unstable();

    let min_count = by_count[0].0;
    let max_count = by_count[by_count.len() - 1].0;
    let min_slot = by_count.iter().find(|&&(c, _)| c == min_count).unwrap().1;
    let max_slot = by_count.iter().find(|&&(c, _)| c == max_count).unwrap().1;
    let median_slot = by_count[by_count.len() / 2].1;

    let chosen = vec![
        (max_slot, TimestampType::MaxSensors),
        (min_slot, TimestampType::MinSensors),
        (median_slot, TimestampType::MedianSensors),
    ];
    for &(slot, ttype) in &chosen {
        info!(
            "Representative timestamp {}: {} ({} active sensors)",
            ttype.as_str(),
            crate::stata::slot_to_datetime(slot),
            accepted
                .iter()
                .find(|s| s.slot_min == slot)
                .map(|s| s.rows.len())
                .unwrap_or(0)
        );
    }
    chosen
}

/// Per-grid-point Haversine stats to the contributing sensors, averaged per
/// polygon and attached to the timestamp's base rows.
pub fn distance_rows(
    base_rows: &[KelurahanRow],
    timestamp_type: TimestampType,
    predictions: &[GridPrediction],
    assets: &SpatialAssets,
    sensors: &[Sensor],
) -> Vec<DistanceRow> {
    // (min, median, mean, max) per grid point.
    let per_grid: Vec<(f64, f64, f64, f64)> = assets
        .grid
        .iter()
        .zip(predictions)
        .map(|(point, prediction)| {
            let mut distances: Vec<f64> = prediction
                .neighbors
                .iter()
                .map(|&s| {
                    let sensor = &sensors[s as usize];
                    haversine_km(point.lat, point.lon, sensor.latitude, sensor.longitude)
                })
                .collect();
            distances.sort_unstable_by(f64::total_cmp);
            let n = distances.len();
            let median = if n % 2 == 1 {
                distances[n / 2]
            } else {
                (distances[n / 2 - 1] + distances[n / 2]) / 2.0
            };
            let mean = distances.iter().sum::<f64>() / n as f64;
            (distances[0], median, mean, distances[n - 1])
        })
        .collect();

    let mut rows = Vec::with_capacity(base_rows.len());
    let mut base_iter = base_rows.iter();
    for (polygon, grid_ids) in assets.polygon_grids.iter().enumerate() {
        if grid_ids.is_empty() {
            continue;
        }
        let base = base_iter
            .next()
            .expect("base rows and populated polygons must align")
            .clone();
        debug_assert_eq!(base.kelurahan, assets.kelurahan[polygon].name);

        let n = grid_ids.len() as f64;
        let mut sums = (0.0, 0.0, 0.0, 0.0);
        for &id in grid_ids {
            let g = per_grid[id as usize];
            sums.0 += g.0;
            sums.1 += g.1;
            sums.2 += g.2;
            sums.3 += g.3;
        }
        rows.push(DistanceRow {
            base,
            timestamp_type,
            min_distance_km: sums.0 / n,
            median_distance_km: sums.1 / n,
            avg_distance_km: sums.2 / n,
            max_distance_km: sums.3 / n,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(slot_min: i64, n_active: usize) -> SlotActive {
        SlotActive {
            slot_min,
            rows: (0..n_active).map(|i| (i as u32, 10.0)).collect(),
        }
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of longitude at the equator is ~111.19 km.
        let d = haversine_km(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111.19).abs() < 0.1, "got {}", d);
        assert_eq!(haversine_km(-6.2, 106.8, -6.2, 106.8), 0.0);
    }

    #[test]
    fn test_representative_selection() {
        // Active counts [100, 80, 60, 55, 50] -> max 100, min 50, median 60.
        let accepted: Vec<SlotActive> = [100, 80, 60, 55, 50]
            .iter()
            .enumerate()
            .map(|(i, &n)| slot(i as i64 * 30, n))
            .collect();
        let chosen = select_representatives(&accepted);
        assert_eq!(chosen.len(), 3);
        assert_eq!(chosen[0], (0, TimestampType::MaxSensors));
        assert_eq!(chosen[1], (120, TimestampType::MinSensors));
        assert_eq!(chosen[2], (60, TimestampType::MedianSensors));
    }

    #[test]
    fn test_upper_median_on_even_count() {
        let accepted: Vec<SlotActive> = [50, 60, 70, 80]
            .iter()
            .enumerate()
            .map(|(i, &n)| slot(i as i64 * 30, n))
            .collect();
        let chosen = select_representatives(&accepted);
        // Upper median of [50, 60, 70, 80] is 70, at slot 60.
        assert_eq!(chosen[2], (60, TimestampType::MedianSensors));
    }

    #[test]
    fn test_count_ties_pick_earliest_slot() {
        let accepted: Vec<SlotActive> = [60, 60, 50, 50]
            .iter()
            .enumerate()
            .map(|(i, &n)| slot(i as i64 * 30, n))
            .collect();
        let chosen = select_representatives(&accepted);
        assert_eq!(chosen[0].0, 0);
        assert_eq!(chosen[1].0, 60);
    }
}
