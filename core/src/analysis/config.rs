use serde::{Deserialize, Serialize};

use crate::prelude::{CoreError, CoreResult};

/// Tunable thresholds of the flight analyzer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Edge of a ground coverage cell.
    pub cell_size_m: f64,
    /// Single-link merge distance between captures.
    pub hotspot_merge_m: f64,
    pub hotspot_min_captures: usize,
    /// Altitude band used for a hotspot's recommended altitude.
    pub hotspot_altitude_band_m: f64,
    /// Altitude band used for the flight's optimal altitude.
    pub efficiency_altitude_band_m: f64,
    /// Cell estimate for polygon areas, whose area is not computed.
    pub polygon_fallback_cells: f64,
    pub spike_factor: f64,
    pub spike_high_factor: f64,
    pub gap_m: f64,
    pub gap_high_m: f64,
    pub altitude_sigma: f64,
    pub altitude_high_sigma: f64,
    /// Share of poor cells above which denser scanning is suggested.
    pub poor_coverage_fraction: f64,
    /// Percentage of repeated segments above which the path is flagged.
    pub redundant_path_percent: f64,
    /// Signals per minute below which the flight is considered too fast.
    pub min_detection_rate: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            cell_size_m: 50.0,
            hotspot_merge_m: 100.0,
            hotspot_min_captures: 3,
            hotspot_altitude_band_m: 10.0,
            efficiency_altitude_band_m: 20.0,
            polygon_fallback_cells: 1000.0,
            spike_factor: 3.0,
            spike_high_factor: 5.0,
            gap_m: 200.0,
            gap_high_m: 500.0,
            altitude_sigma: 2.0,
            altitude_high_sigma: 3.0,
            poor_coverage_fraction: 0.2,
            redundant_path_percent: 20.0,
            min_detection_rate: 1.0,
        }
    }
}

impl AnalyzerConfig {
    /// Sizes are divisors when keying cells and bands.
    pub fn validate(&self) -> CoreResult<()> {
        let lengths = [
            ("cell size", self.cell_size_m),
            ("hotspot merge distance", self.hotspot_merge_m),
            ("hotspot altitude band", self.hotspot_altitude_band_m),
            ("efficiency altitude band", self.efficiency_altitude_band_m),
            ("polygon fallback cells", self.polygon_fallback_cells),
        ];
        if let Some((name, value)) = lengths
            .iter()
            .find(|(_, value)| !value.is_finite() || *value <= 0.0)
        {
            return Err(CoreError::InvalidConfig(format!(
                "{} must be positive, got {}",
                name, value
            )));
        }
        if self.hotspot_min_captures == 0 {
            return Err(CoreError::InvalidConfig(
                "a hotspot needs at least one capture".into(),
            ));
        }
        let thresholds = [
            self.spike_factor,
            self.spike_high_factor,
            self.gap_m,
            self.gap_high_m,
            self.altitude_sigma,
            self.altitude_high_sigma,
            self.poor_coverage_fraction,
            self.redundant_path_percent,
            self.min_detection_rate,
        ];
        if thresholds.iter().any(|value| !value.is_finite() || *value < 0.0) {
            return Err(CoreError::InvalidConfig(
                "anomaly and recommendation thresholds must be finite and non-negative".into(),
            ));
        }
        if self.spike_high_factor < self.spike_factor
            || self.gap_high_m < self.gap_m
            || self.altitude_high_sigma < self.altitude_sigma
        {
            return Err(CoreError::InvalidConfig(
                "high-severity thresholds must not be below their medium ones".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AnalyzerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let zero_cell = AnalyzerConfig {
            cell_size_m: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            zero_cell.validate(),
            Err(CoreError::InvalidConfig(message)) if message.contains("cell size")
        ));
        let zero_band = AnalyzerConfig {
            hotspot_altitude_band_m: 0.0,
            ..Default::default()
        };
        assert!(zero_band.validate().is_err());
        let nan_band = AnalyzerConfig {
            efficiency_altitude_band_m: f64::NAN,
            ..Default::default()
        };
        assert!(nan_band.validate().is_err());
    }

    #[test]
    fn inverted_severity_thresholds_are_rejected() {
        let config = AnalyzerConfig {
            gap_m: 600.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }
}
