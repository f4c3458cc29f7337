pub mod frame;
pub mod signal;

pub use frame::SpectrumFrame;
pub use signal::{
    DeviceRecord, RelationshipEdge, RelationshipRecord, SignalObservation, SignalRecord,
};
