use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prelude::{CoreError, CoreResult};

/// One sweep result as produced by the hardware sweep subprocess.
///
/// `frequency_start`/`frequency_end` are the band edges in Hz; `bins` holds one
/// power reading (dB) per equally wide bin across that band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpectrumFrame {
    pub frequency_start: f64,
    pub frequency_end: f64,
    pub bin_count: usize,
    pub bins: Vec<f32>,
    pub sample_rate: f64,
    pub timestamp: DateTime<Utc>,
}

impl SpectrumFrame {
    pub fn new(
        frequency_start: f64,
        frequency_end: f64,
        bins: Vec<f32>,
        sample_rate: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            frequency_start,
            frequency_end,
            bin_count: bins.len(),
            bins,
            sample_rate,
            timestamp,
        }
    }

    /// Width of a single bin in Hz.
    pub fn bin_width(&self) -> f64 {
        if self.bin_count == 0 {
            return 0.0;
        }
        (self.frequency_end - self.frequency_start) / self.bin_count as f64
    }

    /// Centre frequency of bin `index` in MHz.
    pub fn bin_frequency_mhz(&self, index: usize) -> f64 {
        (self.frequency_start + (index as f64 + 0.5) * self.bin_width()) / 1e6
    }

    /// Iterates `(centre MHz, power)` for every bin.
    pub fn bins_mhz(&self) -> impl Iterator<Item = (f64, f32)> + '_ {
        self.bins
            .iter()
            .enumerate()
            .map(move |(idx, &power)| (self.bin_frequency_mhz(idx), power))
    }

    /// Strongest bin as `(centre MHz, power)`.
    pub fn peak(&self) -> Option<(f64, f32)> {
        self.bins_mhz()
            .filter(|(_, power)| power.is_finite())
            .fold(None, |best, candidate| match best {
                Some((_, p)) if p >= candidate.1 => best,
                _ => Some(candidate),
            })
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !self.frequency_start.is_finite() || !self.frequency_end.is_finite() {
            return Err(CoreError::DataCorruption("non-finite band edge".into()));
        }
        if self.frequency_end <= self.frequency_start {
            return Err(CoreError::DataCorruption(format!(
                "band end {} not above start {}",
                self.frequency_end, self.frequency_start
            )));
        }
        if self.bin_count == 0 || self.bins.len() != self.bin_count {
            return Err(CoreError::DataCorruption(format!(
                "bin count {} does not match {} bins",
                self.bin_count,
                self.bins.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> SpectrumFrame {
        SpectrumFrame::new(
            433_000_000.0,
            435_000_000.0,
            vec![-90.0, -40.0, -85.0, -88.0],
            20e6,
            Utc::now(),
        )
    }

    #[test]
    fn bin_frequencies_are_bin_centres() {
        let frame = frame();
        assert_eq!(frame.bin_width(), 500_000.0);
        assert!((frame.bin_frequency_mhz(0) - 433.25).abs() < 1e-9);
        assert!((frame.bin_frequency_mhz(3) - 434.75).abs() < 1e-9);
    }

    #[test]
    fn peak_returns_strongest_bin() {
        let (freq, power) = frame().peak().unwrap();
        assert!((freq - 433.75).abs() < 1e-9);
        assert_eq!(power, -40.0);
    }

    #[test]
    fn validate_rejects_mismatched_bin_count() {
        let mut frame = frame();
        frame.bin_count = 7;
        assert!(matches!(frame.validate(), Err(CoreError::DataCorruption(_))));
    }
}
