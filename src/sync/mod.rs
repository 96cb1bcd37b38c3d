mod error;
mod render;
mod scheduler;
mod snapshot;

pub use render::{MapRenderer, Marker};
pub use scheduler::{SyncScheduler, SyncSettings};
pub use snapshot::Selection;
