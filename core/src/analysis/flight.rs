use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::math::geo::{GeoBounds, GeoPoint};

/// One telemetry sample along the flown path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlightPoint {
    pub lat: f64,
    pub lon: f64,
    /// Metres above the take-off point.
    pub altitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Remaining battery in percent, when the autopilot reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
}

impl FlightPoint {
    pub fn new(lat: f64, lon: f64, altitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            lat,
            lon,
            altitude,
            timestamp,
            battery: None,
        }
    }

    pub fn with_battery(mut self, battery: f64) -> Self {
        self.battery = Some(battery);
        self
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::with_altitude(self.lat, self.lon, self.altitude)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapturedSignal {
    pub id: String,
    /// MHz.
    pub frequency: f64,
    pub power: f64,
}

/// Everything heard at one position during the flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalCapture {
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signals: Vec<CapturedSignal>,
}

impl SignalCapture {
    pub fn position(&self) -> GeoPoint {
        GeoPoint::with_altitude(self.lat, self.lon, self.altitude)
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    pub fn total_power(&self) -> f64 {
        self.signals.iter().map(|signal| signal.power).sum()
    }

    pub fn average_power(&self) -> Option<f64> {
        if self.signals.is_empty() {
            None
        } else {
            Some(self.total_power() / self.signals.len() as f64)
        }
    }
}

/// Region the flight was meant to cover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AreaOfInterest {
    Circle { center: GeoPoint, radius_m: f64 },
    Rectangle { bounds: GeoBounds },
    Polygon { vertices: Vec<GeoPoint> },
}

impl AreaOfInterest {
    /// Ground area in square metres; `None` for polygons, whose area is not estimated.
    pub fn area_m2(&self) -> Option<f64> {
        match self {
            AreaOfInterest::Circle { radius_m, .. } => Some(PI * radius_m * radius_m),
            AreaOfInterest::Rectangle { bounds } => Some(bounds.area_m2()),
            AreaOfInterest::Polygon { .. } => None,
        }
    }
}

/// Bounding box of the flown path, or `None` for an empty path.
pub fn path_bounds(path: &[FlightPoint]) -> Option<GeoBounds> {
    let first = path.first()?;
    let mut bounds = GeoBounds::new(first.lat, first.lat, first.lon, first.lon);
    for point in &path[1..] {
        bounds.north = bounds.north.max(point.lat);
        bounds.south = bounds.south.min(point.lat);
        bounds.east = bounds.east.max(point.lon);
        bounds.west = bounds.west.min(point.lon);
    }
    Some(bounds)
}
