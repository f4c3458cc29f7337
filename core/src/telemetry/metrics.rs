use serde::Serialize;
use std::sync::Mutex;

pub struct MetricsRecorder {
    inner: Mutex<Metrics>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Metrics {
    pub frames: u64,
    pub malformed_lines: u64,
    pub crashes: u64,
    pub sessions: u64,
    pub stored_signals: u64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Metrics::default()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut Metrics)) {
        if let Ok(mut metrics) = self.inner.lock() {
            apply(&mut metrics);
        }
    }

    pub fn record_frame(&self) {
        self.update(|m| m.frames += 1);
    }

    pub fn record_malformed(&self) {
        self.update(|m| m.malformed_lines += 1);
    }

    pub fn record_crash(&self) {
        self.update(|m| m.crashes += 1);
    }

    pub fn record_session(&self) {
        self.update(|m| m.sessions += 1);
    }

    pub fn record_stored(&self, count: usize) {
        self.update(|m| m.stored_signals += count as u64);
    }

    pub fn snapshot(&self) -> Metrics {
        if let Ok(metrics) = self.inner.lock() {
            *metrics
        } else {
            Metrics::default()
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
