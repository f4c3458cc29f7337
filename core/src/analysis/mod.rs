//! Post-flight analysis of a recorded path and the signals captured along it.

pub mod anomalies;
pub mod config;
pub mod coverage;
pub mod efficiency;
pub mod flight;
pub mod hotspots;
pub mod recommendations;

use serde::{Deserialize, Serialize};

use crate::prelude::CoreResult;
use crate::telemetry::LogManager;

pub use anomalies::{AnomalyKind, FlightAnomaly, Severity};
pub use config::AnalyzerConfig;
pub use coverage::{CellKey, CoverageCell, CoverageQuality};
pub use efficiency::FlightEfficiency;
pub use flight::{AreaOfInterest, CapturedSignal, FlightPoint, SignalCapture};
pub use hotspots::SignalHotspot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlightAnalysis {
    pub coverage_map: Vec<CoverageCell>,
    pub signal_hotspots: Vec<SignalHotspot>,
    pub flight_efficiency: FlightEfficiency,
    pub recommendations: Vec<String>,
    pub anomalies: Vec<FlightAnomaly>,
}

/// Stateless; one analyzer can serve any number of flights concurrently.
pub struct FlightPathAnalyzer {
    config: AnalyzerConfig,
    logger: LogManager,
}

impl FlightPathAnalyzer {
    pub fn new(config: AnalyzerConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            logger: LogManager::new("analysis"),
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Never fails; degenerate input yields empty or zeroed sections.
    pub fn analyze(
        &self,
        flight_path: &[FlightPoint],
        captures: &[SignalCapture],
        area_of_interest: Option<&AreaOfInterest>,
    ) -> FlightAnalysis {
        let config = &self.config;
        let coverage_map = coverage::build_coverage_map(flight_path, captures, config.cell_size_m);
        let signal_hotspots = hotspots::find_hotspots(
            captures,
            config.hotspot_merge_m,
            config.hotspot_min_captures,
            config.hotspot_altitude_band_m,
        );
        let flight_efficiency = efficiency::flight_efficiency(
            flight_path,
            captures,
            area_of_interest,
            coverage_map.len(),
            config,
        );
        let anomalies = anomalies::detect_anomalies(flight_path, captures, config);
        let recommendations = recommendations::recommend(
            &coverage_map,
            &signal_hotspots,
            &flight_efficiency,
            &anomalies,
            config,
        );

        self.logger.record(&format!(
            "analyzed {} points, {} captures: {} cells, {} hotspots, {} anomalies",
            flight_path.len(),
            captures.len(),
            coverage_map.len(),
            signal_hotspots.len(),
            anomalies.len()
        ));

        FlightAnalysis {
            coverage_map,
            signal_hotspots,
            flight_efficiency,
            recommendations,
            anomalies,
        }
    }
}

impl Default for FlightPathAnalyzer {
    fn default() -> Self {
        Self {
            config: AnalyzerConfig::default(),
            logger: LogManager::new("analysis"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn analyzer_rejects_zero_cell_size() {
        let config = AnalyzerConfig {
            cell_size_m: 0.0,
            ..Default::default()
        };
        assert!(FlightPathAnalyzer::new(config).is_err());
        assert!(FlightPathAnalyzer::new(AnalyzerConfig::default()).is_ok());
    }

    #[test]
    fn empty_flight_is_degenerate_not_an_error() {
        let analysis = FlightPathAnalyzer::default().analyze(&[], &[], None);
        assert!(analysis.coverage_map.is_empty());
        assert!(analysis.signal_hotspots.is_empty());
        assert!(analysis.anomalies.is_empty());
        assert!(analysis.recommendations.is_empty());
        assert_eq!(analysis.flight_efficiency, FlightEfficiency::default());
    }

    #[test]
    fn single_point_has_zeroed_efficiency() {
        let path = vec![FlightPoint::new(1.0, 1.0, 30.0, start())];
        let analysis = FlightPathAnalyzer::default().analyze(&path, &[], None);
        assert_eq!(analysis.coverage_map.len(), 1);
        assert_eq!(analysis.flight_efficiency, FlightEfficiency::default());
    }

    #[test]
    fn survey_over_an_emitter() {
        let path: Vec<FlightPoint> = (0..10)
            .map(|i| {
                FlightPoint::new(
                    0.0 + i as f64 * 0.0002,
                    0.0,
                    40.0,
                    start() + Duration::seconds(i * 10),
                )
            })
            .collect();
        let captures: Vec<SignalCapture> = path
            .iter()
            .map(|point| SignalCapture {
                lat: point.lat,
                lon: point.lon,
                altitude: point.altitude,
                timestamp: point.timestamp,
                signals: vec![CapturedSignal {
                    id: "beacon".into(),
                    frequency: 433.92,
                    power: -45.0,
                }],
            })
            .collect();
        let aoi = AreaOfInterest::Circle {
            center: path[5].position(),
            radius_m: 200.0,
        };

        let analysis = FlightPathAnalyzer::default().analyze(&path, &captures, Some(&aoi));
        assert_eq!(analysis.signal_hotspots.len(), 1);
        assert_eq!(analysis.signal_hotspots[0].device_count, 1);
        assert_eq!(analysis.signal_hotspots[0].dominant_frequency, 400.0);
        assert!(analysis.anomalies.is_empty());
        assert!(analysis.flight_efficiency.total_distance_m > 190.0);
        assert!((analysis.flight_efficiency.signal_detection_rate - 10.0 / 1.5).abs() < 1e-9);
        assert!(analysis.flight_efficiency.coverage_ratio > 0.0);
        assert!(analysis.flight_efficiency.coverage_ratio <= 1.0);
        // Every cell hears at most a few signals, so coverage advice comes first.
        assert!(analysis.recommendations[0].contains("poor coverage"));
    }

    #[test]
    fn analysis_serializes_with_snake_case_tags() {
        let path = vec![
            FlightPoint::new(0.0, 0.0, 50.0, start()),
            FlightPoint::new(0.0054, 0.0, 50.0, start() + Duration::seconds(30)),
        ];
        let analysis = FlightPathAnalyzer::default().analyze(&path, &[], None);
        let json = serde_json::to_value(&analysis).unwrap();
        assert_eq!(json["anomalies"][0]["type"], "coverage_gap");
        assert_eq!(json["anomalies"][0]["severity"], "high");
        assert_eq!(json["coverage_map"][0]["coverage_quality"], "poor");
    }
}
