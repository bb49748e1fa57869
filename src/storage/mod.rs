pub mod atomic;
pub mod dedup;
pub mod snapshot;
pub mod status;
pub mod timefmt;

// Re-export common types
pub use atomic::PersistError;
pub use dedup::{DedupStore, ProcessedMap, SeenUrls};
pub use snapshot::SnapshotDir;
pub use status::{JobStatus, StatusHandle, StatusStore};
