use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::analysis::config::AnalyzerConfig;
use crate::analysis::coverage::CellKey;
use crate::analysis::flight::{path_bounds, AreaOfInterest, FlightPoint, SignalCapture};
use crate::math::geo::haversine_m;

/// How well the flight used its time, distance and battery. All zero for
/// paths with fewer than two points.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlightEfficiency {
    pub total_distance_m: f64,
    pub duration_minutes: f64,
    /// Visited cells over the cells the area should contain, at most 1.
    pub coverage_ratio: f64,
    /// Signals per minute of flight.
    pub signal_detection_rate: f64,
    /// Lower edge of the altitude band with the best `count * (avg_power + 100)`.
    pub optimal_altitude: f64,
    pub redundant_path_percentage: f64,
    /// Metres flown per battery percent consumed; 0 without battery telemetry.
    pub energy_efficiency: f64,
}

pub fn path_length_m(path: &[FlightPoint]) -> f64 {
    path.windows(2)
        .map(|pair| haversine_m(pair[0].lat, pair[0].lon, pair[1].lat, pair[1].lon))
        .sum()
}

/// Cells the area should hold. Polygons use a fixed estimate; with no area the
/// path's bounding box stands in.
fn estimated_cells(
    path: &[FlightPoint],
    area: Option<&AreaOfInterest>,
    config: &AnalyzerConfig,
) -> f64 {
    let cell_area = config.cell_size_m * config.cell_size_m;
    let estimate = match area {
        Some(aoi) => aoi
            .area_m2()
            .map(|m2| m2 / cell_area)
            .unwrap_or(config.polygon_fallback_cells),
        None => path_bounds(path)
            .map(|bounds| bounds.area_m2() / cell_area)
            .unwrap_or(0.0),
    };
    estimate.max(1.0)
}

/// Share of cell-to-cell segments that retrace an earlier segment, in percent.
/// Segments inside a single cell are not counted.
fn redundant_percentage(path: &[FlightPoint], cell_size_m: f64) -> f64 {
    let mut seen: HashMap<(CellKey, CellKey), usize> = HashMap::new();
    let mut segments = 0usize;
    let mut repeats = 0usize;
    for pair in path.windows(2) {
        let from = CellKey::of(pair[0].lat, pair[0].lon, cell_size_m);
        let to = CellKey::of(pair[1].lat, pair[1].lon, cell_size_m);
        if from == to {
            continue;
        }
        segments += 1;
        let visits = seen.entry((from, to)).or_default();
        if *visits > 0 {
            repeats += 1;
        }
        *visits += 1;
    }
    if segments == 0 {
        0.0
    } else {
        repeats as f64 / segments as f64 * 100.0
    }
}

fn optimal_altitude(captures: &[SignalCapture], band_m: f64) -> f64 {
    let mut bands: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for capture in captures.iter().filter(|c| !c.signals.is_empty()) {
        let entry = bands
            .entry((capture.altitude / band_m).floor() as i64)
            .or_default();
        entry.0 += capture.total_power();
        entry.1 += capture.signal_count();
    }
    bands
        .into_iter()
        .map(|(band, (power, count))| {
            let average = power / count as f64;
            (band, count as f64 * (average + 100.0))
        })
        .fold(None::<(i64, f64)>, |best, (band, score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((band, score)),
        })
        .map(|(band, _)| band as f64 * band_m)
        .unwrap_or(0.0)
}

pub fn flight_efficiency(
    path: &[FlightPoint],
    captures: &[SignalCapture],
    area: Option<&AreaOfInterest>,
    visited_cells: usize,
    config: &AnalyzerConfig,
) -> FlightEfficiency {
    let (first, last) = match (path.first(), path.last()) {
        (Some(first), Some(last)) if path.len() >= 2 => (first, last),
        _ => return FlightEfficiency::default(),
    };

    let total_distance_m = path_length_m(path);
    let duration_minutes =
        ((last.timestamp - first.timestamp).num_milliseconds() as f64 / 60_000.0).max(0.0);
    let total_signals: usize = captures.iter().map(|c| c.signal_count()).sum();
    let signal_detection_rate = if duration_minutes > 0.0 {
        total_signals as f64 / duration_minutes
    } else {
        0.0
    };
    let coverage_ratio =
        (visited_cells as f64 / estimated_cells(path, area, config)).min(1.0);

    let battery_used = path
        .iter()
        .find_map(|p| p.battery)
        .zip(path.iter().rev().find_map(|p| p.battery))
        .map(|(start, end)| start - end)
        .unwrap_or(0.0);
    let energy_efficiency = if battery_used > 0.0 {
        total_distance_m / battery_used
    } else {
        0.0
    };

    FlightEfficiency {
        total_distance_m,
        duration_minutes,
        coverage_ratio,
        signal_detection_rate,
        optimal_altitude: optimal_altitude(captures, config.efficiency_altitude_band_m),
        redundant_path_percentage: redundant_percentage(path, config.cell_size_m),
        energy_efficiency,
    }
}
