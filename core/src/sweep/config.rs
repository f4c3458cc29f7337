use serde::{Deserialize, Serialize};

use crate::prelude::{CoreError, CoreResult};
use crate::sweep::backoff::BackoffPolicy;

/// Lowest bin width the sweep driver accepts; narrower bins overload it.
pub const MIN_BIN_WIDTH_HZ: u32 = 2_445;
pub const MAX_BIN_WIDTH_HZ: u32 = 5_000_000;

/// One configured target frequency in MHz.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FrequencyTarget {
    pub value: f64,
}

impl FrequencyTarget {
    pub fn mhz(value: f64) -> Self {
        Self { value }
    }
}

/// Frequency list and dwell for one sweep session; immutable once started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleConfig {
    pub frequencies: Vec<FrequencyTarget>,
    /// Dwell per frequency entry.
    pub cycle_time_ms: u64,
    /// Lap counter, filled in when the config is re-announced.
    #[serde(default)]
    pub lap: u64,
}

impl CycleConfig {
    pub fn new(frequencies: Vec<FrequencyTarget>, cycle_time_ms: u64) -> CoreResult<Self> {
        if frequencies.is_empty() {
            return Err(CoreError::InvalidConfig("frequency list is empty".into()));
        }
        if let Some(bad) = frequencies
            .iter()
            .find(|target| !target.value.is_finite() || target.value <= 0.0)
        {
            return Err(CoreError::InvalidConfig(format!(
                "frequency {} MHz is not positive",
                bad.value
            )));
        }
        if cycle_time_ms == 0 {
            return Err(CoreError::InvalidConfig("cycle time must be positive".into()));
        }
        Ok(Self {
            frequencies,
            cycle_time_ms,
            lap: 0,
        })
    }
}

/// Tunables for the supervisor and its subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Width of the band swept around each target.
    pub span_mhz: f64,
    pub bin_width_hz: u32,
    pub lna_gain: u32,
    pub vga_gain: u32,
    pub amp_enabled: bool,
    /// Treat the subprocess as hung when it prints nothing for this long.
    pub stall_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub health_timeout_ms: u64,
    /// A running session is unhealthy when its last frame is older than this.
    pub health_stale_after_ms: u64,
    pub channel_capacity: usize,
    /// A subscriber that cannot take an event within this long is detached.
    pub delivery_timeout_ms: u64,
    pub backoff: BackoffPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            span_mhz: 20.0,
            bin_width_hz: 100_000,
            lna_gain: 32,
            vga_gain: 20,
            amp_enabled: false,
            stall_timeout_ms: 10_000,
            stop_timeout_ms: 3_000,
            health_timeout_ms: 5_000,
            health_stale_after_ms: 5_000,
            channel_capacity: 256,
            delivery_timeout_ms: 1_000,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !self.span_mhz.is_finite() || self.span_mhz <= 0.0 {
            return Err(CoreError::InvalidConfig("span must be positive".into()));
        }
        if !(MIN_BIN_WIDTH_HZ..=MAX_BIN_WIDTH_HZ).contains(&self.bin_width_hz) {
            return Err(CoreError::InvalidConfig(format!(
                "bin width {} Hz outside {}..={}",
                self.bin_width_hz, MIN_BIN_WIDTH_HZ, MAX_BIN_WIDTH_HZ
            )));
        }
        if self.stall_timeout_ms == 0
            || self.health_timeout_ms == 0
            || self.delivery_timeout_ms == 0
        {
            return Err(CoreError::InvalidConfig("timeouts must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "subscriber channel capacity must be positive".into(),
            ));
        }
        self.backoff.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_config_rejects_empty_and_zero_dwell() {
        assert!(matches!(
            CycleConfig::new(vec![], 1000),
            Err(CoreError::InvalidConfig(_))
        ));
        assert!(matches!(
            CycleConfig::new(vec![FrequencyTarget::mhz(433.92)], 0),
            Err(CoreError::InvalidConfig(_))
        ));
        assert!(CycleConfig::new(vec![FrequencyTarget::mhz(-1.0)], 10).is_err());
    }

    #[test]
    fn default_manager_config_is_valid() {
        ManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn narrow_bins_are_rejected() {
        let config = ManagerConfig {
            bin_width_hz: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
