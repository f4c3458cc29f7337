pub mod geo;
pub mod stats;

pub use geo::{GeoBounds, GeoPoint};
pub use stats::StatsHelper;
