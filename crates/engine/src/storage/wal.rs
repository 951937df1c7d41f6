//! Write-ahead log entries
//!
//! A WAL entry is written before a directory side effect that cannot be
//! undone and deleted once storage reflects it. Entries carry a kind tag and
//! a creation time; the payload is kind specific.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Storage, StorageError, get_json, keys, put_json};

/// Kind tag for static role rotations
pub const STATIC_ROTATION: &str = "static-rotation";

/// Kind tag for library check-ins
pub const CHECK_IN: &str = "check-in";

/// Stored WAL envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Entry id (the key suffix)
    pub id: String,
    /// Kind tag
    pub kind: String,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// Kind-specific payload
    pub data: serde_json::Value,
}

impl WalEntry {
    /// Decode the payload; `None` when it does not match `T`
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Write a new entry and return its id
pub async fn put_wal<T: Serialize + Sync>(
    storage: &dyn Storage,
    kind: &str,
    payload: &T,
) -> Result<String, StorageError> {
    let id = Uuid::new_v4().to_string();
    let key = keys::key(keys::WAL, &id);
    let data = serde_json::to_value(payload).map_err(|source| StorageError::Codec {
        key: key.clone(),
        source,
    })?;
    let entry = WalEntry {
        id: id.clone(),
        kind: kind.to_string(),
        created_at: Utc::now(),
        data,
    };
    put_json(storage, &key, &entry).await?;
    Ok(id)
}

/// Read an entry
pub async fn get_wal(storage: &dyn Storage, id: &str) -> Result<Option<WalEntry>, StorageError> {
    get_json(storage, &keys::key(keys::WAL, id)).await
}

/// Ids of every entry
pub async fn list_wal(storage: &dyn Storage) -> Result<Vec<String>, StorageError> {
    storage.list(keys::WAL).await
}

/// Remove an entry
pub async fn delete_wal(storage: &dyn Storage, id: &str) -> Result<(), StorageError> {
    storage.delete(&keys::key(keys::WAL, id)).await
}
