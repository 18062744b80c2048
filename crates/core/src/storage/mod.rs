pub mod snapshot;

pub use snapshot::{JsonSnapshotStore, SnapshotStore};
