//! Per-timestamp Inverse Distance Weighting on the fixed grid.
//!
//! Neighbor selection uses planar Euclidean distance in degrees, an
//! approximation the compact study area (~1° x 1.6°) keeps honest.
//! Haversine distances appear only in provenance reporting.

use crate::grid::GridPoint;
use crate::models::Sensor;

/// IDW output at one grid point: the prediction and the contributing
/// sensor indices (provenance for polygon aggregation).
#[derive(Debug, Clone)]
pub struct GridPrediction {
    pub value: f64,
    pub neighbors: Vec<u32>,
}

/// Interpolates one timestamp over the whole grid from the active sensor
/// rows `(sensor index, pm25)`. Brute-force neighbor search: with ~100
/// active sensors a scan beats tree overhead.
pub fn interpolate_timestamp(
    grid: &[GridPoint],
    active: &[(u32, f64)],
    sensors: &[Sensor],
    neighbors: usize,
    power: f64,
) -> Vec<GridPrediction> {
    let positions: Vec<(f64, f64, f64)> = active
        .iter()
        .map(|&(sensor, value)| {
            let s = &sensors[sensor as usize];
            (s.longitude, s.latitude, value)
        })
        .collect();

    let mut scratch: Vec<(f64, usize)> = Vec::with_capacity(positions.len());
    grid.iter()
        .map(|point| predict_point(point, active, &positions, neighbors, power, &mut scratch))
        .collect()
}

fn predict_point(
    point: &GridPoint,
    active: &[(u32, f64)],
    positions: &[(f64, f64, f64)],
    neighbors: usize,
    power: f64,
    scratch: &mut Vec<(f64, usize)>,
) -> GridPrediction {
    scratch.clear();
    for (j, &(lon, lat, _)) in positions.iter().enumerate() {
        let dx = point.lon - lon;
        let dy = point.lat - lat;
        scratch.push((dx * dx + dy * dy, j));
    }

    let k = neighbors.min(scratch.len());
    if k < scratch.len() {
        scratch.select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0));
        scratch.truncate(k);
    }

    // Degenerate-weight rule: a zero distance short-circuits to the
    // co-located sensor value (averaged if several coincide).
    let exact: Vec<usize> = scratch
        .iter()
        .filter(|(d2, _)| *d2 == 0.0)
        .map(|&(_, j)| j)
        .collect();
    if !exact.is_empty() {
        let value = exact.iter().map(|&j| positions[j].2).sum::<f64>() / exact.len() as f64;
        return GridPrediction {
            value,
            neighbors: exact.iter().map(|&j| active[j].0).collect(),
        };
    }

    let mut weight_sum = 0.0;
    let mut value_sum = 0.0;
    let mut contributing = Vec::with_capacity(k);
    for &(d2, j) in scratch.iter() {
        let w = d2.sqrt().powf(-power);
        weight_sum += w;
        value_sum += w * positions[j].2;
        contributing.push(active[j].0);
    }

    GridPrediction {
        value: value_sum / weight_sum,
        neighbors: contributing,
    }
}
