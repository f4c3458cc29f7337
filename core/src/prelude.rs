use serde::{Deserialize, Serialize};

use crate::sweep::state::SweepState;

/// Classification attached to `error` events and failed health probes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    DeviceUnavailable,
    SubprocessCrash,
    Timeout,
    DataCorruption,
}

/// Common error type for the sweep, store and analysis layers.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("sweep subprocess crashed: {0}")]
    SubprocessCrash(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("data corruption: {0}")]
    DataCorruption(String),
    #[error("store i/o failure: {0}")]
    StoreIo(String),
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: SweepState, to: SweepState },
    #[error("crash backoff exhausted after {crashes} consecutive crashes")]
    BackoffExhausted { crashes: u32 },
}

impl CoreError {
    /// Builds an error of the given fault classification.
    pub fn from_fault(kind: FaultKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            FaultKind::DeviceUnavailable => CoreError::DeviceUnavailable(detail),
            FaultKind::SubprocessCrash => CoreError::SubprocessCrash(detail),
            FaultKind::Timeout => CoreError::Timeout(detail),
            FaultKind::DataCorruption => CoreError::DataCorruption(detail),
        }
    }

    /// Fault classification for hardware-level errors, `None` for caller mistakes.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            CoreError::DeviceUnavailable(_) => Some(FaultKind::DeviceUnavailable),
            CoreError::SubprocessCrash(_) | CoreError::BackoffExhausted { .. } => {
                Some(FaultKind::SubprocessCrash)
            }
            CoreError::Timeout(_) => Some(FaultKind::Timeout),
            CoreError::DataCorruption(_) => Some(FaultKind::DataCorruption),
            CoreError::InvalidConfig(_)
            | CoreError::StoreIo(_)
            | CoreError::InvalidTransition { .. } => None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
