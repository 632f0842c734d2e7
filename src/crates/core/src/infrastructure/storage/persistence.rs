//! Key-path storage
//!
//! Keys are string segment paths such as `["message", session_id, message_id]`.
//! Every access goes through the per-key [`KeyedLock`].

use super::lock::KeyedLock;
use crate::util::errors::{StewardError, StewardResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub type StorageMutator = Box<dyn FnOnce(&mut Value) -> StewardResult<()> + Send>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Fails with [`StewardError::NotFound`] when the key is absent.
    async fn read(&self, key: &[&str]) -> StewardResult<Value>;

    async fn write(&self, key: &[&str], value: Value) -> StewardResult<()>;

    /// Read-modify-write under the key's write lock. Returns the new value.
    async fn update(&self, key: &[&str], mutator: StorageMutator) -> StewardResult<Value>;

    /// Removing an absent key is not an error.
    async fn remove(&self, key: &[&str]) -> StewardResult<()>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &[&str]) -> StewardResult<Vec<Vec<String>>>;
}

/// Typed helpers over [`Storage`].
#[async_trait]
pub trait StorageExt: Storage {
    async fn read_as<T: DeserializeOwned>(&self, key: &[&str]) -> StewardResult<T> {
        let value = self.read(key).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn write_as<T: Serialize + Sync>(&self, key: &[&str], value: &T) -> StewardResult<()> {
        let value = serde_json::to_value(value)?;
        self.write(key, value).await
    }

    async fn update_as<T, F>(&self, key: &[&str], f: F) -> StewardResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(&mut T) + Send + 'static,
    {
        let mutator: StorageMutator = Box::new(move |value: &mut Value| -> StewardResult<()> {
            let mut typed: T = serde_json::from_value(value.take())?;
            f(&mut typed);
            *value = serde_json::to_value(&typed)?;
            Ok(())
        });
        let updated = self.update(key, mutator).await?;
        Ok(serde_json::from_value(updated)?)
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

fn join_key(key: &[&str]) -> String {
    key.join("/")
}

fn not_found(key: &[&str]) -> StewardError {
    StewardError::NotFound(format!("Storage key not found: {}", join_key(key)))
}

/// Process-local storage. Used by tests and by hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryStorage {
    data: Mutex<BTreeMap<Vec<String>, Value>>,
    lock: KeyedLock,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn owned(key: &[&str]) -> Vec<String> {
        key.iter().map(|s| s.to_string()).collect()
    }

    fn get(&self, key: &[&str]) -> Option<Value> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.get(&Self::owned(key)).cloned()
    }

    fn put(&self, key: &[&str], value: Value) {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert(Self::owned(key), value);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &[&str]) -> StewardResult<Value> {
        let _guard = self.lock.read(&join_key(key)).await;
        self.get(key).ok_or_else(|| not_found(key))
    }

    async fn write(&self, key: &[&str], value: Value) -> StewardResult<()> {
        let _guard = self.lock.write(&join_key(key)).await;
        self.put(key, value);
        Ok(())
    }

    async fn update(&self, key: &[&str], mutator: StorageMutator) -> StewardResult<Value> {
        let _guard = self.lock.write(&join_key(key)).await;
        let mut value = self.get(key).ok_or_else(|| not_found(key))?;
        mutator(&mut value)?;
        self.put(key, value.clone());
        Ok(value)
    }

    async fn remove(&self, key: &[&str]) -> StewardResult<()> {
        let _guard = self.lock.write(&join_key(key)).await;
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.remove(&Self::owned(key));
        Ok(())
    }

    async fn list(&self, prefix: &[&str]) -> StewardResult<Vec<Vec<String>>> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data
            .keys()
            .filter(|k| k.len() >= prefix.len() && k.iter().zip(prefix).all(|(a, b)| a == b))
            .cloned()
            .collect())
    }
}

/// Rejects segments that would escape the storage root.
fn check_segment(segment: &str) -> StewardResult<()> {
    let invalid =
        segment.is_empty() || segment == "." || segment == ".." || segment.contains(['/', '\\']);
    if invalid {
        return Err(StewardError::validation(format!(
            "Invalid storage key segment: {}",
            segment
        )));
    }
    Ok(())
}

/// One JSON file per key under a root directory: `root/a/b/c.json`.
pub struct FileStorage {
    root: PathBuf,
    lock: KeyedLock,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: KeyedLock::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &[&str]) -> StewardResult<PathBuf> {
        if key.is_empty() {
            return Err(StewardError::validation("Storage key must not be empty"));
        }
        let mut path = self.root.clone();
        for (index, segment) in key.iter().enumerate() {
            check_segment(segment)?;
            if index + 1 == key.len() {
                path.push(format!("{}.json", segment));
            } else {
                path.push(segment);
            }
        }
        Ok(path)
    }

    async fn read_file(&self, key: &[&str], path: &Path) -> StewardResult<Value> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(key)),
            Err(e) => Err(StewardError::storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write_file(&self, path: &Path, value: &Value) -> StewardResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, key: &[&str]) -> StewardResult<Value> {
        let path = self.path_for(key)?;
        let _guard = self.lock.read(&join_key(key)).await;
        self.read_file(key, &path).await
    }

    async fn write(&self, key: &[&str], value: Value) -> StewardResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.lock.write(&join_key(key)).await;
        self.write_file(&path, &value).await
    }

    async fn update(&self, key: &[&str], mutator: StorageMutator) -> StewardResult<Value> {
        let path = self.path_for(key)?;
        let _guard = self.lock.write(&join_key(key)).await;
        let mut value = self.read_file(key, &path).await?;
        mutator(&mut value)?;
        self.write_file(&path, &value).await?;
        Ok(value)
    }

    async fn remove(&self, key: &[&str]) -> StewardResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.lock.write(&join_key(key)).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &[&str]) -> StewardResult<Vec<Vec<String>>> {
        let mut base = self.root.clone();
        for segment in prefix {
            check_segment(segment)?;
            base.push(segment);
        }

        let mut keys = Vec::new();
        let mut pending = vec![(base, prefix.iter().map(|s| s.to_string()).collect::<Vec<_>>())];
        while let Some((dir, segments)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let file_type = entry.file_type().await?;
                let mut next = segments.clone();
                if file_type.is_dir() {
                    next.push(name);
                    pending.push((entry.path(), next));
                } else if let Some(stem) = name.strip_suffix(".json") {
                    next.push(stem.to_string());
                    keys.push(next);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
