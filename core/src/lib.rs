//! Core sweep supervision, signal aggregation and spatial analytics.
//!
//! The modules cover the live path (hardware sweep subprocess, frame fan-out,
//! detection aggregation), the persisted path (grid-indexed signal and device
//! store) and the offline flight-path analysis built on top of stored captures.

pub mod analysis;
pub mod math;
pub mod prelude;
pub mod processing;
pub mod records;
pub mod store;
pub mod sweep;
pub mod telemetry;

pub use prelude::{CoreError, CoreResult, FaultKind};
