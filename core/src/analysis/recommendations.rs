use crate::analysis::anomalies::{FlightAnomaly, Severity};
use crate::analysis::config::AnalyzerConfig;
use crate::analysis::coverage::{CoverageCell, CoverageQuality};
use crate::analysis::efficiency::FlightEfficiency;
use crate::analysis::hotspots::SignalHotspot;

/// Operator advice derived from the other results. Output order is fixed:
/// coverage, hotspot, path, detection rate, anomalies.
pub fn recommend(
    coverage: &[CoverageCell],
    hotspots: &[SignalHotspot],
    efficiency: &FlightEfficiency,
    anomalies: &[FlightAnomaly],
    config: &AnalyzerConfig,
) -> Vec<String> {
    let mut advice = Vec::new();

    if !coverage.is_empty() {
        let poor = coverage
            .iter()
            .filter(|cell| cell.coverage_quality == CoverageQuality::Poor)
            .count();
        let fraction = poor as f64 / coverage.len() as f64;
        if fraction > config.poor_coverage_fraction {
            advice.push(format!(
                "{:.0}% of visited cells have poor coverage; scan those areas with a denser pattern",
                fraction * 100.0
            ));
        }
    }

    if let Some(top) = hotspots.first() {
        advice.push(format!(
            "Strongest hotspot at {:.6}, {:.6} (intensity {:.2}, {} devices around {:.0} MHz); survey it at about {:.0} m",
            top.position.lat,
            top.position.lon,
            top.intensity,
            top.device_count,
            top.dominant_frequency,
            top.recommended_altitude
        ));
    }

    if efficiency.redundant_path_percentage > config.redundant_path_percent {
        advice.push(format!(
            "{:.0}% of path segments retrace earlier ones; optimise the flight plan",
            efficiency.redundant_path_percentage
        ));
    }

    if efficiency.duration_minutes > 0.0
        && efficiency.signal_detection_rate < config.min_detection_rate
    {
        advice.push(format!(
            "Only {:.2} signals per minute; fly slower or lower to improve detection",
            efficiency.signal_detection_rate
        ));
    }

    let high = anomalies
        .iter()
        .filter(|anomaly| anomaly.severity == Severity::High)
        .count();
    if high > 0 {
        advice.push(format!(
            "{} high-severity anomalies need investigation",
            high
        ));
    }

    advice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::anomalies::AnomalyKind;
    use crate::analysis::coverage::CellKey;
    use crate::math::geo::{GeoBounds, GeoPoint};
    use chrono::Utc;

    fn cell(signal_count: usize) -> CoverageCell {
        CoverageCell {
            key: CellKey { row: 0, col: 0 },
            bounds: GeoBounds::new(0.0, 0.0, 0.0, 0.0),
            center: GeoPoint::new(0.0, 0.0),
            altitudes: vec![30.0],
            signal_count,
            average_power: None,
            coverage_quality: CoverageQuality::from_signal_count(signal_count),
        }
    }

    #[test]
    fn quiet_healthy_flight_gets_no_advice() {
        let efficiency = FlightEfficiency {
            duration_minutes: 10.0,
            signal_detection_rate: 5.0,
            ..Default::default()
        };
        let advice = recommend(
            &[cell(25), cell(30)],
            &[],
            &efficiency,
            &[],
            &AnalyzerConfig::default(),
        );
        assert!(advice.is_empty());
    }

    #[test]
    fn every_rule_fires_in_order() {
        let efficiency = FlightEfficiency {
            duration_minutes: 10.0,
            signal_detection_rate: 0.5,
            redundant_path_percentage: 40.0,
            ..Default::default()
        };
        let hotspot = SignalHotspot {
            position: GeoPoint::new(51.5, -0.12),
            radius: 40.0,
            intensity: 0.8,
            dominant_frequency: 400.0,
            device_count: 3,
            recommended_altitude: 30.0,
            capture_count: 5,
            total_signals: 50,
            average_power: -40.0,
        };
        let anomaly = FlightAnomaly {
            timestamp: Utc::now(),
            position: GeoPoint::new(0.0, 0.0),
            kind: AnomalyKind::CoverageGap,
            severity: Severity::High,
            description: String::new(),
        };
        let advice = recommend(
            &[cell(0), cell(30)],
            &[hotspot],
            &efficiency,
            &[anomaly],
            &AnalyzerConfig::default(),
        );
        assert_eq!(advice.len(), 5);
        assert!(advice[0].starts_with("50%"));
        assert!(advice[1].contains("51.500000, -0.120000"));
        assert!(advice[1].ends_with("about 30 m"));
        assert!(advice[2].contains("retrace"));
        assert!(advice[3].contains("0.50 signals per minute"));
        assert!(advice[4].starts_with("1 high-severity"));
    }
}
