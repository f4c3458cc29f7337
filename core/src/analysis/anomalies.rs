use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::config::AnalyzerConfig;
use crate::analysis::flight::{FlightPoint, SignalCapture};
use crate::math::geo::{haversine_m, GeoPoint};
use crate::math::stats::StatsHelper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SignalSpike,
    CoverageGap,
    AltitudeDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlightAnomaly {
    pub timestamp: DateTime<Utc>,
    pub position: GeoPoint,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub description: String,
}

/// Captures hearing more than `spike_factor` times the mean signal count.
pub fn signal_spikes(captures: &[SignalCapture], config: &AnalyzerConfig) -> Vec<FlightAnomaly> {
    let counts: Vec<f64> = captures.iter().map(|c| c.signal_count() as f64).collect();
    let mean = StatsHelper::mean(&counts);
    if mean <= 0.0 {
        return Vec::new();
    }

    captures
        .iter()
        .zip(counts.iter())
        .filter(|(_, &count)| count > config.spike_factor * mean)
        .map(|(capture, &count)| FlightAnomaly {
            timestamp: capture.timestamp,
            position: capture.position(),
            kind: AnomalyKind::SignalSpike,
            severity: if count > config.spike_high_factor * mean {
                Severity::High
            } else {
                Severity::Medium
            },
            description: format!(
                "{} signals captured, {:.1}x the flight mean of {:.1}",
                count,
                count / mean,
                mean
            ),
        })
        .collect()
}

/// Consecutive path points further apart than `gap_m`, reported at the later point.
pub fn coverage_gaps(path: &[FlightPoint], config: &AnalyzerConfig) -> Vec<FlightAnomaly> {
    path.windows(2)
        .filter_map(|pair| {
            let distance = haversine_m(pair[0].lat, pair[0].lon, pair[1].lat, pair[1].lon);
            if distance <= config.gap_m {
                return None;
            }
            Some(FlightAnomaly {
                timestamp: pair[1].timestamp,
                position: pair[1].position(),
                kind: AnomalyKind::CoverageGap,
                severity: if distance > config.gap_high_m {
                    Severity::High
                } else {
                    Severity::Medium
                },
                description: format!("{:.0} m between consecutive telemetry points", distance),
            })
        })
        .collect()
}

/// Path points whose altitude strays more than `altitude_sigma` deviations from the mean.
pub fn altitude_deviations(path: &[FlightPoint], config: &AnalyzerConfig) -> Vec<FlightAnomaly> {
    let altitudes: Vec<f64> = path.iter().map(|p| p.altitude).collect();
    let mean = StatsHelper::mean(&altitudes);
    let sigma = StatsHelper::std_dev(&altitudes);
    if sigma <= f64::EPSILON {
        return Vec::new();
    }

    path.iter()
        .filter_map(|point| {
            let deviation = (point.altitude - mean).abs() / sigma;
            if deviation <= config.altitude_sigma {
                return None;
            }
            Some(FlightAnomaly {
                timestamp: point.timestamp,
                position: point.position(),
                kind: AnomalyKind::AltitudeDeviation,
                severity: if deviation > config.altitude_high_sigma {
                    Severity::High
                } else {
                    Severity::Medium
                },
                description: format!(
                    "altitude {:.1} m is {:.1} sigma from the mean of {:.1} m",
                    point.altitude, deviation, mean
                ),
            })
        })
        .collect()
}

/// Runs every detector; anomalies are ordered by time.
pub fn detect_anomalies(
    path: &[FlightPoint],
    captures: &[SignalCapture],
    config: &AnalyzerConfig,
) -> Vec<FlightAnomaly> {
    let mut anomalies = signal_spikes(captures, config);
    anomalies.extend(coverage_gaps(path, config));
    anomalies.extend(altitude_deviations(path, config));
    anomalies.sort_by_key(|anomaly| anomaly.timestamp);
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::flight::CapturedSignal;
    use chrono::Duration;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn capture(seconds: i64, count: usize) -> SignalCapture {
        SignalCapture {
            lat: 0.0,
            lon: 0.0,
            altitude: 40.0,
            timestamp: start() + Duration::seconds(seconds),
            signals: vec![
                CapturedSignal {
                    id: "x".into(),
                    frequency: 100.0,
                    power: -50.0,
                };
                count
            ],
        }
    }

    #[test]
    fn gap_of_600_m_is_one_high_anomaly() {
        // 0.0054 deg of latitude is about 600 m.
        let path = vec![
            FlightPoint::new(0.0, 0.0, 50.0, start()),
            FlightPoint::new(0.0054, 0.0, 50.0, start() + Duration::seconds(30)),
        ];
        let anomalies = detect_anomalies(&path, &[], &AnalyzerConfig::default());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::CoverageGap);
        assert_eq!(anomalies[0].severity, Severity::High);
    }

    #[test]
    fn gap_between_thresholds_is_medium() {
        let path = vec![
            FlightPoint::new(0.0, 0.0, 50.0, start()),
            FlightPoint::new(0.0027, 0.0, 50.0, start()),
            FlightPoint::new(0.0028, 0.0, 50.0, start()),
        ];
        let gaps = coverage_gaps(&path, &AnalyzerConfig::default());
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].severity, Severity::Medium);
    }

    #[test]
    fn spikes_scale_with_mean() {
        // Mean is 1.5; 6 is above 3x but not 5x.
        let mut captures: Vec<SignalCapture> = (0..9).map(|i| capture(i, 1)).collect();
        captures.push(capture(9, 6));
        let config = AnalyzerConfig::default();
        let spikes = signal_spikes(&captures, &config);
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].severity, Severity::Medium);
        assert_eq!(spikes[0].timestamp, start() + Duration::seconds(9));

        // Mean is 3.7; 20 is above 5x and 9 stays below 3x.
        captures[8] = capture(8, 9);
        captures[9] = capture(9, 20);
        let spikes = signal_spikes(&captures, &config);
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].severity, Severity::High);
    }

    #[test]
    fn silent_flight_has_no_spikes() {
        let captures: Vec<SignalCapture> = (0..5).map(|i| capture(i, 0)).collect();
        assert!(signal_spikes(&captures, &AnalyzerConfig::default()).is_empty());
    }

    #[test]
    fn altitude_outlier_is_flagged() {
        let mut path: Vec<FlightPoint> = (0..20)
            .map(|i| FlightPoint::new(0.0, 0.0, 50.0, start() + Duration::seconds(i)))
            .collect();
        path[10].altitude = 120.0;
        let deviations = altitude_deviations(&path, &AnalyzerConfig::default());
        assert_eq!(deviations.len(), 1);
        assert_eq!(deviations[0].severity, Severity::High);
        assert_eq!(deviations[0].position.altitude, Some(120.0));
    }

    #[test]
    fn level_flight_has_no_altitude_anomalies() {
        let path: Vec<FlightPoint> = (0..5)
            .map(|i| FlightPoint::new(0.0, 0.0, 50.0, start() + Duration::seconds(i)))
            .collect();
        assert!(altitude_deviations(&path, &AnalyzerConfig::default()).is_empty());
    }
}
