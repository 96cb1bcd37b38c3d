mod timestamp;
pub(crate) mod types;

pub use types::{ObjectType, SensorReading, TrackedObject};
