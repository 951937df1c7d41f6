//! In-memory [`Storage`]
//!
//! Used by tests and by hosts that embed the engine without persistence.
//! Clones share the same map, so a "restarted" engine can be pointed at the
//! state an earlier instance left behind. Writes can be made to fail by key
//! prefix to simulate a crash between two storage writes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{Storage, StorageError};

#[derive(Debug)]
struct InjectedFailure {
    prefix: String,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    put_failures: Mutex<Vec<InjectedFailure>>,
}

/// Shared in-memory key-value store
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` puts whose key starts with `prefix`
    pub fn fail_puts(&self, prefix: &str, times: usize) {
        self.inner.put_failures.lock().push(InjectedFailure {
            prefix: prefix.to_string(),
            remaining: times,
        });
    }

    /// Drop every pending injected failure
    pub fn clear_failures(&self) {
        self.inner.put_failures.lock().clear();
    }

    /// Every key currently stored
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.read().keys().cloned().collect()
    }

    fn take_put_failure(&self, key: &str) -> bool {
        let mut failures = self.inner.put_failures.lock();
        match failures
            .iter_mut()
            .find(|f| f.remaining > 0 && key.starts_with(&f.prefix))
        {
            Some(failure) => {
                failure.remaining -= 1;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        if self.take_put_failure(key) {
            return Err(StorageError::Backend {
                key: key.to_string(),
                message: "injected put failure".to_string(),
            });
        }
        self.inner.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.inner.entries.read();
        let children: BTreeSet<String> = entries
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .map(|k| {
                let rest = &k[prefix.len()..];
                match rest.find('/') {
                    Some(slash) => rest[..=slash].to_string(),
                    None => rest.to_string(),
                }
            })
            .collect();
        Ok(children.into_iter().collect())
    }
}
