//! Storage system
//!
//! Key-path persistence and the per-key lock guarding it.

pub mod lock;
pub mod persistence;

pub use lock::{KeyLockGuard, KeyedLock, LockMode};
pub use persistence::{FileStorage, MemoryStorage, Storage, StorageExt, StorageMutator};
