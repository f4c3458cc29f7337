use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::prelude::{CoreError, CoreResult};

/// Lifecycle of the sweep subprocess supervisor.
///
/// `Idle → Initializing → Running → Stopping → Idle`, with `Error` reachable from
/// every other state and left only through a forced cleanup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SweepState {
    #[default]
    Idle,
    Initializing,
    Running,
    Stopping,
    Error,
}

impl SweepState {
    pub fn can_transition_to(self, next: SweepState) -> bool {
        use SweepState::*;
        match (self, next) {
            (Error, Error) => false,
            (_, Error) => true,
            (Idle, Initializing)
            | (Initializing, Running)
            | (Initializing, Stopping)
            | (Running, Stopping)
            | (Stopping, Idle) => true,
            _ => false,
        }
    }

    /// True while a session owns (or is acquiring) the hardware.
    pub fn is_active(self) -> bool {
        matches!(self, SweepState::Initializing | SweepState::Running)
    }
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepState::Idle => "idle",
            SweepState::Initializing => "initializing",
            SweepState::Running => "running",
            SweepState::Stopping => "stopping",
            SweepState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChange {
    pub from: SweepState,
    pub to: SweepState,
    pub at: DateTime<Utc>,
}

/// Snapshot of the supervisor, mutated only by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SweepStatus {
    pub state: SweepState,
    /// Target currently tuned, in MHz.
    pub current_frequency: Option<f64>,
    pub cycle_index: usize,
    pub lap: u64,
    pub frames_received: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Process id of the live sweep subprocess.
    pub pid: Option<u32>,
}

impl SweepStatus {
    pub fn transition(&mut self, next: SweepState) -> CoreResult<StateChange> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let change = StateChange {
            from: self.state,
            to: next,
            at: Utc::now(),
        };
        self.state = next;
        if next == SweepState::Idle {
            self.current_frequency = None;
            self.pid = None;
        }
        Ok(change)
    }

    /// Returns to `Idle` from any state, clearing per-session fields.
    /// Yields `None` when already idle.
    pub fn force_idle(&mut self) -> Option<StateChange> {
        let from = self.state;
        self.current_frequency = None;
        self.cycle_index = 0;
        self.lap = 0;
        self.pid = None;
        if from == SweepState::Idle {
            return None;
        }
        self.state = SweepState::Idle;
        Some(StateChange {
            from,
            to: SweepState::Idle,
            at: Utc::now(),
        })
    }
}
