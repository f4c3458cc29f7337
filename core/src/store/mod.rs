//! Geo-indexed persistence for signal observations, device aggregates and
//! device relationships.

pub mod engine;
pub mod fingerprint;
pub mod grid;
pub mod spatial;

pub use engine::{JournalEngine, MemoryEngine, StorageEngine, WriteBatch};
pub use fingerprint::derive_device_id;
pub use grid::{GridCell, GridIndex, GRID_SCALE};
pub use spatial::{CleanupReport, RadiusQuery, SpatialSignalStore, StoreStatistics};
