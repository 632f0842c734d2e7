//! Per-key reader/writer lock
//!
//! Readers share a key only while no writer holds it or waits for it. A
//! release hands the key to the oldest queued writer first, otherwise to
//! every queued reader at once. Keys with no holders and no waiters are
//! dropped from the table.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Default)]
struct KeyState {
    readers: usize,
    writer: bool,
    waiting_readers: VecDeque<oneshot::Sender<KeyLockGuard>>,
    waiting_writers: VecDeque<oneshot::Sender<KeyLockGuard>>,
}

impl KeyState {
    fn is_idle(&self) -> bool {
        self.readers == 0
            && !self.writer
            && self.waiting_readers.is_empty()
            && self.waiting_writers.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    keys: Mutex<HashMap<String, KeyState>>,
}

impl LockTable {
    fn keys(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held access to one key. Dropping it releases the key.
pub struct KeyLockGuard {
    table: Arc<LockTable>,
    key: String,
    mode: LockMode,
    armed: bool,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut keys = self.table.keys();
        let Some(state) = keys.get_mut(&self.key) else {
            return;
        };
        match self.mode {
            LockMode::Read => state.readers = state.readers.saturating_sub(1),
            LockMode::Write => state.writer = false,
        }
        dispatch(&self.table, &self.key, state);
        if state.is_idle() {
            keys.remove(&self.key);
        }
    }
}

/// Hands the key to the next waiters. Must run under the table mutex.
fn dispatch(table: &Arc<LockTable>, key: &str, state: &mut KeyState) {
    if state.writer || state.readers > 0 {
        return;
    }

    while let Some(tx) = state.waiting_writers.pop_front() {
        state.writer = true;
        match tx.send(new_guard(table, key, LockMode::Write)) {
            Ok(()) => return,
            Err(mut abandoned) => {
                // Waiter went away; give the slot to the next one.
                abandoned.armed = false;
                state.writer = false;
            }
        }
    }

    while let Some(tx) = state.waiting_readers.pop_front() {
        state.readers += 1;
        if let Err(mut abandoned) = tx.send(new_guard(table, key, LockMode::Read)) {
            abandoned.armed = false;
            state.readers -= 1;
        }
    }
}

fn new_guard(table: &Arc<LockTable>, key: &str, mode: LockMode) -> KeyLockGuard {
    KeyLockGuard {
        table: table.clone(),
        key: key.to_string(),
        mode,
        armed: true,
    }
}

/// In-memory keyed reader/writer lock.
#[derive(Clone, Default)]
pub struct KeyedLock {
    table: Arc<LockTable>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self, key: &str) -> KeyLockGuard {
        self.acquire(key, LockMode::Read).await
    }

    pub async fn write(&self, key: &str) -> KeyLockGuard {
        self.acquire(key, LockMode::Write).await
    }

    async fn acquire(&self, key: &str, mode: LockMode) -> KeyLockGuard {
        loop {
            let rx = {
                let mut keys = self.table.keys();
                let state = keys.entry(key.to_string()).or_default();
                let free = match mode {
                    LockMode::Read => !state.writer && state.waiting_writers.is_empty(),
                    LockMode::Write => !state.writer && state.readers == 0,
                };
                if free {
                    match mode {
                        LockMode::Read => state.readers += 1,
                        LockMode::Write => state.writer = true,
                    }
                    return new_guard(&self.table, key, mode);
                }
                let (tx, rx) = oneshot::channel();
                match mode {
                    LockMode::Read => state.waiting_readers.push_back(tx),
                    LockMode::Write => state.waiting_writers.push_back(tx),
                }
                rx
            };

            if let Ok(guard) = rx.await {
                return guard;
            }
        }
    }

    /// Number of keys currently tracked (held or waited on).
    pub fn active_keys(&self) -> usize {
        self.table.keys().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn readers_share_a_key() {
        let lock = KeyedLock::new();
        let a = lock.read("k").await;
        let b = tokio::time::timeout(Duration::from_millis(100), lock.read("k"))
            .await
            .expect("second reader should not block");
        drop(a);
        drop(b);
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn writer_excludes_readers_and_writers() {
        let lock = KeyedLock::new();
        let w = lock.write("k").await;
        assert!(tokio::time::timeout(Duration::from_millis(50), lock.read("k"))
            .await
            .is_err());
        assert!(tokio::time::timeout(Duration::from_millis(50), lock.write("k"))
            .await
            .is_err());
        drop(w);
        let _r = lock.read("k").await;
    }

    #[tokio::test]
    async fn queued_writer_blocks_new_readers_and_goes_first() {
        let lock = KeyedLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first_reader = lock.read("k").await;

        let writer = {
            let lock = lock.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _g = lock.write("k").await;
                order.lock().unwrap().push("writer");
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reader = {
            let lock = lock.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _g = lock.read("k").await;
                order.lock().unwrap().push("reader");
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(order.lock().unwrap().is_empty());

        drop(first_reader);
        writer.await.unwrap();
        reader.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["writer", "reader"]);
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let lock = KeyedLock::new();
        let held = lock.write("k").await;

        let abandoned = tokio::time::timeout(Duration::from_millis(20), lock.write("k")).await;
        assert!(abandoned.is_err());

        let acquired = Arc::new(AtomicUsize::new(0));
        let next = {
            let lock = lock.clone();
            let acquired = acquired.clone();
            tokio::spawn(async move {
                let _g = lock.write("k").await;
                acquired.fetch_add(1, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        next.await.unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let lock = KeyedLock::new();
        let _a = lock.write("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), lock.write("b"))
            .await
            .expect("different key should not block");
        assert_eq!(lock.active_keys(), 2);
    }
}
