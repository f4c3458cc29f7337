use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::math::geo::{degree_span, GeoBounds};

/// Cells per degree; one cell is roughly 11 m of latitude.
pub const GRID_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    pub lat: i64,
    pub lon: i64,
}

impl GridCell {
    pub fn of(lat: f64, lon: f64) -> Self {
        Self {
            lat: (lat * GRID_SCALE).floor() as i64,
            lon: (lon * GRID_SCALE).floor() as i64,
        }
    }
}

/// Inclusive cell rectangle.
#[derive(Debug, Clone, Copy)]
struct CellRange {
    lat: (i64, i64),
    lon: (i64, i64),
}

impl CellRange {
    fn covering(bounds: &GeoBounds) -> Self {
        let low = GridCell::of(bounds.south, bounds.west);
        let high = GridCell::of(bounds.north, bounds.east);
        Self {
            lat: (low.lat, high.lat),
            lon: (low.lon, high.lon),
        }
    }

    fn len(&self) -> u128 {
        let lat = self.lat.1.saturating_sub(self.lat.0).saturating_add(1).max(0) as u128;
        let lon = self.lon.1.saturating_sub(self.lon.0).saturating_add(1).max(0) as u128;
        lat.saturating_mul(lon)
    }

    fn contains(&self, cell: &GridCell) -> bool {
        (self.lat.0..=self.lat.1).contains(&cell.lat)
            && (self.lon.0..=self.lon.1).contains(&cell.lon)
    }
}

/// Boxes covering `radius_m` around a point, clamped to valid latitudes and
/// split in two where the longitude span crosses the antimeridian.
fn radius_boxes(lat: f64, lon: f64, radius_m: f64) -> Vec<GeoBounds> {
    let (dlat, dlon) = degree_span(lat, radius_m);
    let north = (lat + dlat).min(90.0);
    let south = (lat - dlat).max(-90.0);
    if dlon >= 180.0 || north >= 90.0 || south <= -90.0 {
        return vec![GeoBounds::new(north, south, 180.0, -180.0)];
    }
    let (west, east) = (lon - dlon, lon + dlon);
    if west < -180.0 {
        vec![
            GeoBounds::new(north, south, east, -180.0),
            GeoBounds::new(north, south, 180.0, west + 360.0),
        ]
    } else if east > 180.0 {
        vec![
            GeoBounds::new(north, south, 180.0, west),
            GeoBounds::new(north, south, east - 360.0, -180.0),
        ]
    } else {
        vec![GeoBounds::new(north, south, east, west)]
    }
}

/// Uniform-grid index from cell to the record ids stored in it.
#[derive(Debug, Default)]
pub struct GridIndex {
    cells: HashMap<GridCell, BTreeSet<u64>>,
}

impl GridIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cell: GridCell, id: u64) {
        self.cells.entry(cell).or_default().insert(id);
    }

    pub fn remove(&mut self, cell: GridCell, id: u64) {
        if let Some(ids) = self.cells.get_mut(&cell) {
            ids.remove(&id);
            if ids.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }

    /// Ids in every cell intersecting `bounds`. Walks the cell rectangle when it
    /// is smaller than the set of occupied cells, otherwise filters the occupied
    /// cells, so wide queries stay bounded by the data size.
    pub fn candidates_in_bounds(&self, bounds: &GeoBounds) -> Vec<u64> {
        let range = CellRange::covering(bounds);
        let mut ids = Vec::new();
        if range.len() <= self.cells.len() as u128 {
            for lat in range.lat.0..=range.lat.1 {
                for lon in range.lon.0..=range.lon.1 {
                    if let Some(found) = self.cells.get(&GridCell { lat, lon }) {
                        ids.extend(found.iter().copied());
                    }
                }
            }
        } else {
            for (cell, found) in &self.cells {
                if range.contains(cell) {
                    ids.extend(found.iter().copied());
                }
            }
        }
        ids
    }

    /// Coarse phase of a radius query: ids in cells touching the radius's box.
    pub fn candidates_in_radius(&self, lat: f64, lon: f64, radius_m: f64) -> Vec<u64> {
        let mut ids: Vec<u64> = radius_boxes(lat, lon, radius_m)
            .iter()
            .flat_map(|bounds| self.candidates_in_bounds(bounds))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
