pub mod backend;
pub mod backoff;
pub mod config;
pub mod events;
pub mod health;
pub mod lock;
pub mod manager;
pub mod parser;
pub mod process;
pub mod state;

pub use backend::{CommandBackend, HackRfBackend, SweepBackend, TunePlan};
pub use backoff::{BackoffPolicy, CrashBackoff};
pub use config::{CycleConfig, FrequencyTarget, ManagerConfig};
pub use events::{EventBus, Subscription, SweepEvent, SweepFault};
pub use health::HealthResult;
pub use lock::DeviceLock;
pub use manager::SweepManager;
pub use state::{StateChange, SweepState, SweepStatus};
