//! Credential store
//!
//! Typed access to `creds/<role>` and `password/<account>` with a short-lived
//! read-through cache. Every write and delete invalidates the cached entry
//! after storage has accepted it, so the cache never holds a value storage
//! does not.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use crate::model::CredentialRecord;
use crate::storage::{Storage, StorageError, get_json, keys, put_json};

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Reads served from the cache
    pub hits: u64,
    /// Reads that went to storage
    pub misses: u64,
}

/// Credential records with a read cache
pub struct CredentialStore {
    storage: Arc<dyn Storage>,
    cache: Cache<String, CredentialRecord>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Store over `storage` caching reads for `ttl`
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        Self {
            storage,
            cache: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Credentials of a static role
    pub async fn role(&self, role: &str) -> Result<Option<CredentialRecord>, StorageError> {
        self.get(keys::key(keys::CREDS, role)).await
    }

    /// Store credentials of a static role
    pub async fn put_role(&self, role: &str, record: &CredentialRecord) -> Result<(), StorageError> {
        self.put(keys::key(keys::CREDS, role), record).await
    }

    /// Forget credentials of a static role
    pub async fn delete_role(&self, role: &str) -> Result<(), StorageError> {
        self.delete(keys::key(keys::CREDS, role)).await
    }

    /// Password of a library account
    pub async fn account(&self, account: &str) -> Result<Option<CredentialRecord>, StorageError> {
        self.get(keys::key(keys::PASSWORD, account)).await
    }

    /// Store the password of a library account
    pub async fn put_account(
        &self,
        account: &str,
        record: &CredentialRecord,
    ) -> Result<(), StorageError> {
        self.put(keys::key(keys::PASSWORD, account), record).await
    }

    /// Forget the password of a library account
    pub async fn delete_account(&self, account: &str) -> Result<(), StorageError> {
        self.delete(keys::key(keys::PASSWORD, account)).await
    }

    /// Hit/miss counters since creation
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached entry
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    async fn get(&self, key: String) -> Result<Option<CredentialRecord>, StorageError> {
        if let Some(hit) = self.cache.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "credential cache hit");
            return Ok(Some(hit));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let record: Option<CredentialRecord> = get_json(self.storage.as_ref(), &key).await?;
        if let Some(record) = &record {
            self.cache.insert(key, record.clone()).await;
        }
        Ok(record)
    }

    async fn put(&self, key: String, record: &CredentialRecord) -> Result<(), StorageError> {
        put_json(self.storage.as_ref(), &key, record).await?;
        self.cache.invalidate(&key).await;
        Ok(())
    }

    async fn delete(&self, key: String) -> Result<(), StorageError> {
        self.storage.delete(&key).await?;
        self.cache.invalidate(&key).await;
        Ok(())
    }
}
