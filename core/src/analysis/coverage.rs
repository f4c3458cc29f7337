use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analysis::flight::{FlightPoint, SignalCapture};
use crate::math::geo::{GeoBounds, GeoPoint, METERS_PER_DEGREE};

/// Signal counts strictly above these earn the matching grade.
pub const EXCELLENT_ABOVE: usize = 20;
pub const GOOD_ABOVE: usize = 10;
pub const FAIR_ABOVE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl CoverageQuality {
    pub fn from_signal_count(count: usize) -> Self {
        if count > EXCELLENT_ABOVE {
            CoverageQuality::Excellent
        } else if count > GOOD_ABOVE {
            CoverageQuality::Good
        } else if count > FAIR_ABOVE {
            CoverageQuality::Fair
        } else {
            CoverageQuality::Poor
        }
    }
}

/// Ground cell index. Longitude is scaled by the cosine of the sample's own
/// latitude so cells stay roughly square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub row: i64,
    pub col: i64,
}

impl CellKey {
    pub fn of(lat: f64, lon: f64, cell_size_m: f64) -> Self {
        let lon_scale = METERS_PER_DEGREE * lat.to_radians().cos();
        Self {
            row: (lat * METERS_PER_DEGREE / cell_size_m).floor() as i64,
            col: (lon * lon_scale / cell_size_m).floor() as i64,
        }
    }

    pub fn bounds(&self, cell_size_m: f64) -> GeoBounds {
        let south = self.row as f64 * cell_size_m / METERS_PER_DEGREE;
        let north = (self.row + 1) as f64 * cell_size_m / METERS_PER_DEGREE;
        let lon_scale = METERS_PER_DEGREE * ((north + south) / 2.0).to_radians().cos().max(1e-6);
        let west = self.col as f64 * cell_size_m / lon_scale;
        let east = (self.col + 1) as f64 * cell_size_m / lon_scale;
        GeoBounds::new(north, south, east, west)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageCell {
    pub key: CellKey,
    pub bounds: GeoBounds,
    pub center: GeoPoint,
    pub altitudes: Vec<f64>,
    pub signal_count: usize,
    pub average_power: Option<f64>,
    pub coverage_quality: CoverageQuality,
}

#[derive(Default)]
struct CellAccumulator {
    altitudes: Vec<f64>,
    signal_count: usize,
    power_sum: f64,
}

/// Cells visited by the path, ordered by key. Captures only contribute to
/// cells the path passed through.
pub fn build_coverage_map(
    path: &[FlightPoint],
    captures: &[SignalCapture],
    cell_size_m: f64,
) -> Vec<CoverageCell> {
    let mut cells: BTreeMap<CellKey, CellAccumulator> = BTreeMap::new();
    for point in path {
        cells
            .entry(CellKey::of(point.lat, point.lon, cell_size_m))
            .or_default()
            .altitudes
            .push(point.altitude);
    }
    for capture in captures {
        if let Some(cell) = cells.get_mut(&CellKey::of(capture.lat, capture.lon, cell_size_m)) {
            cell.signal_count += capture.signal_count();
            cell.power_sum += capture.total_power();
        }
    }

    cells
        .into_iter()
        .map(|(key, acc)| {
            let bounds = key.bounds(cell_size_m);
            CoverageCell {
                key,
                bounds,
                center: bounds.center(),
                altitudes: acc.altitudes,
                signal_count: acc.signal_count,
                average_power: if acc.signal_count > 0 {
                    Some(acc.power_sum / acc.signal_count as f64)
                } else {
                    None
                },
                coverage_quality: CoverageQuality::from_signal_count(acc.signal_count),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::flight::CapturedSignal;
    use chrono::Utc;

    fn capture_with(lat: f64, lon: f64, count: usize) -> SignalCapture {
        SignalCapture {
            lat,
            lon,
            altitude: 40.0,
            timestamp: Utc::now(),
            signals: (0..count)
                .map(|i| CapturedSignal {
                    id: format!("s{}", i),
                    frequency: 433.9,
                    power: -50.0,
                })
                .collect(),
        }
    }

    #[test]
    fn quality_boundaries_are_strict() {
        assert_eq!(CoverageQuality::from_signal_count(21), CoverageQuality::Excellent);
        assert_eq!(CoverageQuality::from_signal_count(20), CoverageQuality::Good);
        assert_eq!(CoverageQuality::from_signal_count(11), CoverageQuality::Good);
        assert_eq!(CoverageQuality::from_signal_count(10), CoverageQuality::Fair);
        assert_eq!(CoverageQuality::from_signal_count(5), CoverageQuality::Poor);
        assert_eq!(CoverageQuality::from_signal_count(0), CoverageQuality::Poor);
    }

    #[test]
    fn cell_bounds_contain_their_samples() {
        let (lat, lon) = (51.50123, -0.12345);
        let key = CellKey::of(lat, lon, 50.0);
        let bounds = key.bounds(50.0);
        assert!(bounds.contains(lat, lon));
        assert!(((bounds.north - bounds.south) * METERS_PER_DEGREE - 50.0).abs() < 1e-6);
    }

    #[test]
    fn map_accumulates_path_and_captures() {
        let now = Utc::now();
        let path = vec![
            FlightPoint::new(10.0, 10.0, 30.0, now),
            FlightPoint::new(10.00001, 10.00001, 32.0, now),
            FlightPoint::new(10.01, 10.0, 35.0, now),
        ];
        let captures = vec![
            capture_with(10.0, 10.0, 21),
            capture_with(20.0, 20.0, 4),
        ];
        let map = build_coverage_map(&path, &captures, 50.0);
        assert_eq!(map.len(), 2);

        let busy = map.iter().find(|cell| cell.signal_count > 0).unwrap();
        assert_eq!(busy.altitudes, vec![30.0, 32.0]);
        assert_eq!(busy.signal_count, 21);
        assert_eq!(busy.average_power, Some(-50.0));
        assert_eq!(busy.coverage_quality, CoverageQuality::Excellent);

        let quiet = map.iter().find(|cell| cell.signal_count == 0).unwrap();
        assert_eq!(quiet.coverage_quality, CoverageQuality::Poor);
        assert_eq!(quiet.average_power, None);
    }
}
