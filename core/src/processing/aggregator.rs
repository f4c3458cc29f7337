use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::prelude::{CoreError, CoreResult};
use crate::records::SpectrumFrame;
use crate::telemetry::log::LogManager;

/// Deduplicated emission near the active target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalDetection {
    /// Frequency in MHz of the bin that opened the detection.
    pub frequency: f64,
    /// Strongest power seen so far.
    pub power: f32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub tolerance_mhz: f64,
    /// Detections idle for longer than this are closed.
    pub active_window_ms: i64,
    /// Bins weaker than this are treated as noise.
    pub min_power: f32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            tolerance_mhz: 0.5,
            active_window_ms: 5_000,
            min_power: -80.0,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !self.tolerance_mhz.is_finite() || self.tolerance_mhz <= 0.0 {
            return Err(CoreError::InvalidConfig("tolerance must be positive".into()));
        }
        if self.active_window_ms <= 0 {
            return Err(CoreError::InvalidConfig(
                "active window must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Merges repeated spectrum bins around a target into stable detections.
///
/// Single owner; wrap it in a lock for shared use. Detections are kept in the
/// order they were opened.
pub struct SignalAggregator {
    config: AggregatorConfig,
    target_mhz: Option<f64>,
    detections: Vec<SignalDetection>,
    skipped_frames: u64,
    logger: LogManager,
}

impl SignalAggregator {
    pub fn new(config: AggregatorConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            target_mhz: None,
            detections: Vec::new(),
            skipped_frames: 0,
            logger: LogManager::new("aggregator"),
        })
    }

    /// Sets the frequency of interest; a different target drops open detections.
    pub fn set_target(&mut self, target_mhz: f64) {
        if self.target_mhz != Some(target_mhz) {
            self.flush();
            self.target_mhz = Some(target_mhz);
        }
    }

    pub fn target(&self) -> Option<f64> {
        self.target_mhz
    }

    pub fn open_count(&self) -> usize {
        self.detections.len()
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.config.active_window_ms)
    }

    /// Folds the frame's bins near the target into the open detections and
    /// returns how many bins matched. Malformed frames are skipped.
    pub fn add_spectrum_data(&mut self, frame: &SpectrumFrame) -> usize {
        let Some(target) = self.target_mhz else {
            return 0;
        };
        if let Err(err) = frame.validate() {
            self.skipped_frames += 1;
            self.logger.detail(&format!("skipping frame: {}", err));
            return 0;
        }

        let now = frame.timestamp;
        let window = self.window();
        self.detections
            .retain(|detection| now - detection.last_seen <= window);

        let tolerance = self.config.tolerance_mhz;
        let mut matched = 0;
        for (frequency, power) in frame.bins_mhz() {
            if (frequency - target).abs() > tolerance || power < self.config.min_power {
                continue;
            }
            matched += 1;
            let open = self.detections.iter_mut().find(|detection| {
                (detection.frequency - frequency).abs() <= tolerance
                    && now - detection.last_seen <= window
            });
            match open {
                Some(detection) => {
                    if now > detection.last_seen {
                        detection.last_seen = now;
                    }
                    if power > detection.power {
                        detection.power = power;
                    }
                    detection.count += 1;
                }
                None => self.detections.push(SignalDetection {
                    frequency,
                    power,
                    first_seen: now,
                    last_seen: now,
                    count: 1,
                }),
            }
        }
        matched
    }

    /// Open detections within `tolerance_mhz` of `target_mhz`, in open order.
    pub fn aggregated_signals(&self, target_mhz: f64, tolerance_mhz: f64) -> Vec<SignalDetection> {
        self.detections
            .iter()
            .filter(|detection| (detection.frequency - target_mhz).abs() <= tolerance_mhz)
            .cloned()
            .collect()
    }

    pub fn flush(&mut self) {
        if !self.detections.is_empty() {
            self.logger
                .detail(&format!("flushing {} detections", self.detections.len()));
        }
        self.detections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(offset_ms: i64, bins: Vec<f32>) -> SpectrumFrame {
        let base = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        SpectrumFrame::new(
            433_000_000.0,
            435_000_000.0,
            bins,
            20e6,
            base + Duration::milliseconds(offset_ms),
        )
    }

    fn aggregator() -> SignalAggregator {
        let mut aggregator = SignalAggregator::new(AggregatorConfig::default()).unwrap();
        aggregator.set_target(433.92);
        aggregator
    }

    #[test]
    fn same_frame_twice_merges_into_one_detection() {
        let mut aggregator = aggregator();
        let frame = frame_at(0, vec![-90.0, -40.0, -90.0, -90.0]);
        assert_eq!(aggregator.add_spectrum_data(&frame), 1);
        assert_eq!(aggregator.add_spectrum_data(&frame), 1);

        let signals = aggregator.aggregated_signals(433.92, 0.5);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].count, 2);
        assert_eq!(signals[0].power, -40.0);
    }

    #[test]
    fn flush_empties_results() {
        let mut aggregator = aggregator();
        aggregator.add_spectrum_data(&frame_at(0, vec![-90.0, -40.0, -90.0, -90.0]));
        aggregator.flush();
        assert!(aggregator.aggregated_signals(433.92, 0.5).is_empty());
    }

    #[test]
    fn merge_keeps_stronger_power_and_latest_time() {
        let mut aggregator = aggregator();
        aggregator.add_spectrum_data(&frame_at(0, vec![-90.0, -50.0, -90.0, -90.0]));
        aggregator.add_spectrum_data(&frame_at(500, vec![-90.0, -35.0, -90.0, -90.0]));
        aggregator.add_spectrum_data(&frame_at(900, vec![-90.0, -60.0, -90.0, -90.0]));
        let signals = aggregator.aggregated_signals(433.92, 0.5);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].power, -35.0);
        assert_eq!(signals[0].count, 3);
        assert_eq!(
            signals[0].last_seen - signals[0].first_seen,
            Duration::milliseconds(900)
        );
    }

    #[test]
    fn detections_outside_window_are_not_merged() {
        let mut aggregator = aggregator();
        aggregator.add_spectrum_data(&frame_at(0, vec![-90.0, -40.0, -90.0, -90.0]));
        aggregator.add_spectrum_data(&frame_at(6_000, vec![-90.0, -40.0, -90.0, -90.0]));
        let signals = aggregator.aggregated_signals(433.92, 0.5);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].count, 1);
        assert_eq!(signals[0].first_seen, frame_at(6_000, vec![]).timestamp);
    }

    #[test]
    fn bins_away_from_target_and_noise_are_ignored() {
        let mut aggregator = aggregator();
        let matched = aggregator.add_spectrum_data(&frame_at(0, vec![-30.0, -95.0, -90.0, -20.0]));
        assert_eq!(matched, 0);
        assert_eq!(aggregator.open_count(), 0);
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let mut aggregator = aggregator();
        let mut frame = frame_at(0, vec![-90.0, -40.0, -90.0, -90.0]);
        frame.bin_count = 9;
        assert_eq!(aggregator.add_spectrum_data(&frame), 0);
        assert_eq!(aggregator.skipped_frames(), 1);
    }

    #[test]
    fn changing_target_flushes() {
        let mut aggregator = aggregator();
        aggregator.add_spectrum_data(&frame_at(0, vec![-90.0, -40.0, -90.0, -90.0]));
        aggregator.set_target(434.5);
        assert_eq!(aggregator.open_count(), 0);
    }

    #[test]
    fn distinct_emitters_open_distinct_detections_in_order() {
        let config = AggregatorConfig {
            tolerance_mhz: 0.3,
            ..Default::default()
        };
        let mut aggregator = SignalAggregator::new(config).unwrap();
        aggregator.set_target(434.0);
        aggregator.add_spectrum_data(&frame_at(0, vec![-90.0, -45.0, -30.0, -90.0]));
        let signals = aggregator.aggregated_signals(434.0, 1.0);
        assert_eq!(signals.len(), 2);
        assert!(signals[0].frequency < signals[1].frequency);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = AggregatorConfig {
            tolerance_mhz: 0.0,
            ..Default::default()
        };
        assert!(SignalAggregator::new(config).is_err());
    }
}
