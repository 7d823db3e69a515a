pub mod snapshot;

pub use snapshot::{write_frame, SnapshotError};
