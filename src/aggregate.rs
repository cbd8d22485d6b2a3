//! Reduction of grid predictions to per-kelurahan rows with provenance.

use std::collections::BTreeSet;

use crate::grid::SpatialAssets;
use crate::idw::GridPrediction;
use crate::models::KelurahanRow;

/// Aggregates one timestamp's grid predictions into per-polygon rows.
/// Polygons without grid points emit nothing (logged once at startup).
pub fn aggregate_timestamp(
    timestamp_ms: i64,
    predictions: &[GridPrediction],
    assets: &SpatialAssets,
    n_sensors_used: u32,
) -> Vec<KelurahanRow> {
    let mut rows = Vec::with_capacity(assets.polygon_grids.len());
    for (polygon, grid_ids) in assets.polygon_grids.iter().enumerate() {
        if grid_ids.is_empty() {
            continue;
        }

        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut contributing: BTreeSet<u32> = BTreeSet::new();
        for &id in grid_ids {
            let p = &predictions[id as usize];
            sum += p.value;
            min = min.min(p.value);
            max = max.max(p.value);
            contributing.extend(p.neighbors.iter().copied());
        }

        rows.push(KelurahanRow {
            kelurahan: assets.kelurahan[polygon].name.clone(),
            timestamp_ms,
            avg_pm25: sum / grid_ids.len() as f64,
            min_pm25: min,
            max_pm25: max,
            n_grids: grid_ids.len() as u32,
            n_sensors_used,
            n_contributing_sensors: contributing.len() as u32,
        });
    }
    rows
}
