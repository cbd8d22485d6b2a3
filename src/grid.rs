//! Kelurahan polygon loading, the fixed interpolation grid, and the
//! one-time grid-to-polygon assignment.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use geo::{BoundingRect, Contains, Coord, LineString, MultiPolygon, Point, Polygon, Rect};
use rstar::{RTree, RTreeObject, AABB};
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::models::RunSummary;

/// Kelurahan name attributes tried in order.
const NAME_FIELD_PRIORITY: &[&str] = &[
    "KELURAHAN_NAME",
    "NAMOBJ",
    "NAMA",
    "DESA",
    "NAME",
    "KELURAHAN",
];

#[derive(Debug, Clone)]
pub struct Kelurahan {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

/// One retained lattice point. The implicit id is the index in the grid
/// vector, row order.
#[derive(Debug, Clone, Copy)]
pub struct GridPoint {
    pub lon: f64,
    pub lat: f64,
    pub polygon: u32,
}

/// Immutable spatial assets shared read-only with every worker.
#[derive(Debug)]
pub struct SpatialAssets {
    pub kelurahan: Vec<Kelurahan>,
    pub grid: Vec<GridPoint>,
    /// Grid point ids grouped by polygon, precomputed for O(1) aggregation.
    pub polygon_grids: Vec<Vec<u32>>,
}

/// Picks the kelurahan name from the attribute table: the priority list
/// first, then the first character attribute in alphabetical field order.
/// `None` means the caller synthesizes a sequential name.
pub fn pick_name(fields: &BTreeMap<String, String>) -> Option<String> {
    for candidate in NAME_FIELD_PRIORITY {
        if let Some(value) = fields.get(*candidate) {
            if !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    fields
        .iter()
        .find(|(_, v)| !v.trim().is_empty())
        .map(|(_, v)| v.trim().to_string())
}

/// Reads the kelurahan polygons. Missing name attributes are recoverable
/// (sequential names, one warning); an unreadable file or a file with no
/// polygons is fatal.
pub fn load_shapefile(path: &Path) -> Result<Vec<Kelurahan>> {
    let shapes = shapefile::read_as::<_, shapefile::Polygon, shapefile::dbase::Record>(path)
        .map_err(|e| EngineError::Geometry(format!("cannot read shapefile {:?}: {}", path, e)))?;

    if shapes.is_empty() {
        return Err(EngineError::Geometry(format!("shapefile {:?} has no polygons", path)).into());
    }

    let mut kelurahan = Vec::with_capacity(shapes.len());
    let mut synthesized = 0usize;
    for (index, (polygon, record)) in shapes.into_iter().enumerate() {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in record {
            if let shapefile::dbase::FieldValue::Character(Some(text)) = value {
                fields.insert(name, text);
            }
        }
        let name = match pick_name(&fields) {
            Some(name) => name,
            None => {
                synthesized += 1;
                format!("Kelurahan {}", index + 1)
            }
        };
        kelurahan.push(Kelurahan {
            name,
            geometry: rings_to_multipolygon(&polygon),
        });
    }
    if synthesized > 0 {
        warn!(
            "No usable name attribute for {} of {} polygons; synthesized sequential names",
            synthesized,
            kelurahan.len()
        );
    }
    info!("Loaded {} kelurahan polygons", kelurahan.len());
    Ok(kelurahan)
}

/// Converts shapefile rings to a [`MultiPolygon`]: each outer ring becomes a
/// polygon, each inner ring is attached to the first outer ring containing
/// its first vertex.
fn rings_to_multipolygon(polygon: &shapefile::Polygon) -> MultiPolygon<f64> {
    let mut outers: Vec<LineString<f64>> = Vec::new();
    let mut inners: Vec<LineString<f64>> = Vec::new();
    for ring in polygon.rings() {
        let coords: Vec<Coord<f64>> = ring
            .points()
            .iter()
            .map(|p| Coord { x: p.x, y: p.y })
            .collect();
        match ring {
            shapefile::PolygonRing::Outer(_) => outers.push(LineString::from(coords)),
            shapefile::PolygonRing::Inner(_) => inners.push(LineString::from(coords)),
        }
    }

    if outers.is_empty() {
        return MultiPolygon::new(Vec::new());
    }

    let mut holes: Vec<Vec<LineString<f64>>> = vec![Vec::new(); outers.len()];
    for inner in inners {
        let probe = inner
            .points()
            .next()
            .map(|p| Point::new(p.x(), p.y()));
        let target = probe.and_then(|p| {
            outers
                .iter()
                .position(|outer| Polygon::new(outer.clone(), Vec::new()).contains(&p))
        });
        // An orphan hole degenerates to the first outer ring.
        holes[target.unwrap_or(0)].push(inner);
    }

    MultiPolygon::new(
        outers
            .into_iter()
            .zip(holes)
            .map(|(exterior, interiors)| Polygon::new(exterior, interiors))
            .collect(),
    )
}

struct PolygonEnvelope {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for PolygonEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Builds the planar lattice over the polygon-union bounding rectangle and
/// assigns each retained point to its first containing polygon. Computed
/// once per run.
pub fn build_grid(
    kelurahan: Vec<Kelurahan>,
    cell_size_deg: f64,
    summary: &mut RunSummary,
) -> Result<SpatialAssets> {
    let bounds = union_bounding_rect(&kelurahan)
        .ok_or_else(|| EngineError::Geometry("all polygons are degenerate".into()))
        .context("cannot derive the grid bounding rectangle")?;

    let tree = RTree::bulk_load(
        kelurahan
            .iter()
            .enumerate()
            .filter_map(|(index, k)| {
                k.geometry.bounding_rect().map(|r| PolygonEnvelope {
                    index,
                    envelope: AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]),
                })
            })
            .collect(),
    );

    let mut grid: Vec<GridPoint> = Vec::new();
    let mut polygon_grids: Vec<Vec<u32>> = vec![Vec::new(); kelurahan.len()];
    let mut boundary_ties = 0usize;

    let n_lon = ((bounds.max().x - bounds.min().x) / cell_size_deg).floor() as i64 + 1;
    let n_lat = ((bounds.max().y - bounds.min().y) / cell_size_deg).floor() as i64 + 1;
    for i in 0..n_lat {
        let lat = bounds.min().y + i as f64 * cell_size_deg;
        for j in 0..n_lon {
            let lon = bounds.min().x + j as f64 * cell_size_deg;
            let point = Point::new(lon, lat);

            let mut candidates: Vec<usize> = tree
                .locate_in_envelope_intersecting(&AABB::from_point([lon, lat]))
                .map(|e| e.index)
                .collect();
            candidates.sort_unstable();

            let mut containing = candidates
                .into_iter()
                .filter(|&index| kelurahan[index].geometry.contains(&point));
            if let Some(first) = containing.next() {
                if containing.next().is_some() {
                    boundary_ties += 1;
                }
                let id = grid.len() as u32;
                grid.push(GridPoint {
                    lon,
                    lat,
                    polygon: first as u32,
                });
                polygon_grids[first].push(id);
            }
        }
    }

    if grid.is_empty() {
        return Err(EngineError::Geometry(
            "no grid points fall inside any polygon; check the shapefile CRS".into(),
        )
        .into());
    }

    let empty: Vec<&str> = polygon_grids
        .iter()
        .enumerate()
        .filter(|(_, g)| g.is_empty())
        .map(|(i, _)| kelurahan[i].name.as_str())
        .collect();
    summary.polygons_without_grid = empty.len();
    summary.grid_boundary_ties = boundary_ties;
    if !empty.is_empty() {
        warn!(
            "{} polygons contain no grid point at {}° spacing and will emit no rows: {:?}",
            empty.len(),
            cell_size_deg,
            &empty[..empty.len().min(10)]
        );
    }
    if boundary_ties > 0 {
        info!(
            "{} grid points sit on shared boundaries; first polygon by shapefile order wins",
            boundary_ties
        );
    }
    info!(
        "Grid built: {} points across {} polygons",
        grid.len(),
        kelurahan.len()
    );

    Ok(SpatialAssets {
        kelurahan,
        grid,
        polygon_grids,
    })
}

fn union_bounding_rect(kelurahan: &[Kelurahan]) -> Option<Rect<f64>> {
    let mut bounds: Option<Rect<f64>> = None;
    for k in kelurahan {
        if let Some(r) = k.geometry.bounding_rect() {
            bounds = Some(match bounds {
                None => r,
                Some(b) => Rect::new(
                    Coord {
                        x: b.min().x.min(r.min().x),
                        y: b.min().y.min(r.min().y),
                    },
                    Coord {
                        x: b.max().x.max(r.max().x),
                        y: b.max().y.max(r.max().y),
                    },
                ),
            });
        }
    }
    bounds
}
