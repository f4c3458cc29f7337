use chrono::{DateTime, Duration, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use sweepcore::analysis::{AreaOfInterest, CapturedSignal, FlightPoint, SignalCapture};
use sweepcore::math::geo::{degree_span, haversine_m, GeoPoint};

/// Fixed transmitter on the ground heard by the orbiting aircraft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundEmitter {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub frequency_mhz: f64,
    /// Received power at 1 m.
    pub reference_power_db: f64,
}

/// Circular survey flight around a point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitTemplate {
    pub center: GeoPoint,
    pub radius_m: f64,
    pub altitude_m: f64,
    /// Peak-to-peak altitude wander, metres.
    pub altitude_wander_m: f64,
    pub laps: u32,
    pub points_per_lap: u32,
    pub interval_s: i64,
    pub battery_start: f64,
    pub battery_per_point: f64,
    /// Weakest power a capture still reports.
    pub sensitivity_db: f64,
    pub emitters: Vec<GroundEmitter>,
    pub seed: u64,
}

impl Default for OrbitTemplate {
    fn default() -> Self {
        let center = GeoPoint::new(51.5007, -0.1246);
        Self {
            center,
            radius_m: 300.0,
            altitude_m: 60.0,
            altitude_wander_m: 4.0,
            laps: 2,
            points_per_lap: 36,
            interval_s: 5,
            battery_start: 95.0,
            battery_per_point: 0.2,
            sensitivity_db: -90.0,
            emitters: vec![
                GroundEmitter {
                    id: "ism-433".into(),
                    lat: center.lat + 0.0025,
                    lon: center.lon,
                    frequency_mhz: 433.92,
                    reference_power_db: 10.0,
                },
                GroundEmitter {
                    id: "lora-868".into(),
                    lat: center.lat - 0.002,
                    lon: center.lon + 0.002,
                    frequency_mhz: 868.1,
                    reference_power_db: 5.0,
                },
            ],
            seed: 7,
        }
    }
}

/// Path, captures and area produced from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightRecording {
    pub flight_path: Vec<FlightPoint>,
    pub captures: Vec<SignalCapture>,
    #[serde(default)]
    pub area_of_interest: Option<AreaOfInterest>,
}

/// Free-space loss from 1 m out to the slant range.
fn received_power(emitter: &GroundEmitter, lat: f64, lon: f64, altitude: f64) -> f64 {
    let ground = haversine_m(lat, lon, emitter.lat, emitter.lon);
    let slant = (ground * ground + altitude * altitude).sqrt().max(1.0);
    emitter.reference_power_db - 20.0 * slant.log10()
}

impl OrbitTemplate {
    pub fn record(&self, start: DateTime<Utc>) -> FlightRecording {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let (dlat, dlon) = degree_span(self.center.lat, self.radius_m);
        let total = (self.laps.max(1) * self.points_per_lap.max(3)) as usize;
        let per_lap = self.points_per_lap.max(3) as f64;

        let mut flight_path = Vec::with_capacity(total);
        let mut captures = Vec::with_capacity(total);
        for index in 0..total {
            let angle = 2.0 * PI * index as f64 / per_lap;
            let lat = self.center.lat + dlat * angle.cos();
            let lon = self.center.lon + dlon * angle.sin();
            let wander = if self.altitude_wander_m > 0.0 {
                rng.gen_range(-self.altitude_wander_m / 2.0..self.altitude_wander_m / 2.0)
            } else {
                0.0
            };
            let altitude = self.altitude_m + wander;
            let timestamp = start + Duration::seconds(self.interval_s * index as i64);
            let battery = (self.battery_start - self.battery_per_point * index as f64).max(0.0);

            flight_path.push(FlightPoint::new(lat, lon, altitude, timestamp).with_battery(battery));

            let signals = self
                .emitters
                .iter()
                .map(|emitter| {
                    let fading = rng.gen_range(-2.0..2.0);
                    (emitter, received_power(emitter, lat, lon, altitude) + fading)
                })
                .filter(|(_, power)| *power >= self.sensitivity_db)
                .map(|(emitter, power)| CapturedSignal {
                    id: emitter.id.clone(),
                    frequency: emitter.frequency_mhz,
                    power,
                })
                .collect();
            captures.push(SignalCapture {
                lat,
                lon,
                altitude,
                timestamp,
                signals,
            });
        }

        FlightRecording {
            flight_path,
            captures,
            area_of_interest: Some(AreaOfInterest::Circle {
                center: self.center,
                radius_m: self.radius_m * 1.2,
            }),
        }
    }
}
