//! Infrastructure layer
//!
//! Storage, provider contract, snapshots and logging.

pub mod ai;
pub mod logging;
pub mod snapshot;
pub mod storage;

pub use ai::{ModelProvider, ProviderError};
pub use snapshot::{NoopSnapshot, SnapshotPatch, SnapshotProvider};
pub use storage::{FileStorage, KeyedLock, MemoryStorage, Storage, StorageExt};
