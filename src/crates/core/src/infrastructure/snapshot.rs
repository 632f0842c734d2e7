//! Filesystem checkpoints used to attribute file changes to a step

use crate::util::errors::StewardResult;
use async_trait::async_trait;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPatch {
    pub hash: String,
    pub files: Vec<String>,
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Records the current tree. `None` when snapshots are unavailable.
    async fn track(&self) -> StewardResult<Option<String>>;

    /// Files changed since the checkpoint `hash`.
    async fn patch(&self, hash: &str) -> StewardResult<SnapshotPatch>;
}

/// Snapshotting disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshot;

#[async_trait]
impl SnapshotProvider for NoopSnapshot {
    async fn track(&self) -> StewardResult<Option<String>> {
        Ok(None)
    }

    async fn patch(&self, hash: &str) -> StewardResult<SnapshotPatch> {
        Ok(SnapshotPatch {
            hash: hash.to_string(),
            files: Vec::new(),
        })
    }
}
