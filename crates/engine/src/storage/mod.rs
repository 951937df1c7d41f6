//! Storage adapter
//!
//! The host provides a flat key-value store with durable single-key writes
//! and no transactions ([`Storage`]). Everything the engine persists is a
//! JSON blob under one of the namespaces in [`keys`].

mod memory;
pub mod wal;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use memory::MemoryStorage;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend failed
    #[error("storage backend error on '{key}': {message}")]
    Backend {
        /// Key being accessed
        key: String,
        /// Backend message
        message: String,
    },

    /// A stored value could not be decoded, or a value could not be encoded
    #[error("failed to encode or decode '{key}': {source}")]
    Codec {
        /// Key being accessed
        key: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },
}

/// Host key-value store
///
/// `put` is durable once it returns. `list` returns the keys directly below
/// `prefix`; nested "folders" come back once, with a trailing `/`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Remove a value; removing a missing key succeeds
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List keys under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Storage namespaces
pub mod keys {
    /// Mount configuration
    pub const CONFIG: &str = "config";
    /// Static roles
    pub const STATIC_ROLE: &str = "static-role/";
    /// Dynamic roles
    pub const DYNAMIC_ROLE: &str = "role/";
    /// Library sets
    pub const LIBRARY: &str = "library/";
    /// Check-out records, one per library account
    pub const CHECKOUT: &str = "checkout/";
    /// Library account passwords
    pub const PASSWORD: &str = "password/";
    /// Static role credentials
    pub const CREDS: &str = "creds/";
    /// Write-ahead log
    pub const WAL: &str = "wal/";

    /// Join a namespace and a name
    pub fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}{name}")
    }
}

/// Read and decode a JSON value
pub async fn get_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let Some(raw) = storage.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| StorageError::Codec {
            key: key.to_string(),
            source,
        })
}

/// Encode and write a JSON value
pub async fn put_json<T: Serialize + Sync>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_vec(value).map_err(|source| StorageError::Codec {
        key: key.to_string(),
        source,
    })?;
    storage.put(key, raw).await
}

/// List every leaf key below `prefix`, descending into nested folders
///
/// Returned names are relative to `prefix`.
pub async fn list_recursive(storage: &dyn Storage, prefix: &str) -> Result<Vec<String>, StorageError> {
    let mut out = Vec::new();
    let mut pending = vec![String::new()];
    while let Some(folder) = pending.pop() {
        for entry in storage.list(&format!("{prefix}{folder}")).await? {
            if entry.ends_with('/') {
                pending.push(format!("{folder}{entry}"));
            } else {
                out.push(format!("{folder}{entry}"));
            }
        }
    }
    out.sort();
    Ok(out)
}
