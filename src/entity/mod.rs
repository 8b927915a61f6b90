pub mod instance;
pub mod snapshot;

pub use instance::{Association, EntityRef, InstanceId, InstanceMetadata};
pub use snapshot::EntitySnapshot;
