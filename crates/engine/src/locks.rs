//! Striped lock table
//!
//! Role and set names map onto a fixed array of read-write locks through the
//! first eight bytes of their SHA-256 digest. Locking several names at once
//! always acquires stripes in ascending index order, after deduplication.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Number of stripes
pub const STRIPES: usize = 256;

/// Fixed-size table of read-write locks
#[derive(Debug)]
pub struct LockTable {
    stripes: Vec<Arc<RwLock<()>>>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Stripe index for `name`
pub fn stripe_index(name: &str) -> usize {
    let digest = Sha256::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % STRIPES as u64) as usize
}

impl LockTable {
    /// Table with [`STRIPES`] unlocked stripes
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Arc::new(RwLock::new(()))).collect(),
        }
    }

    /// Exclusive lock for `name`
    pub async fn write(&self, name: &str) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.stripes[stripe_index(name)])
            .write_owned()
            .await
    }

    /// Shared lock for `name`
    pub async fn read(&self, name: &str) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.stripes[stripe_index(name)])
            .read_owned()
            .await
    }

    /// Exclusive locks for several names, acquired in ascending stripe order
    ///
    /// Every engine operation locks a single name; tests use this to check
    /// the ordering rule.
    #[cfg(test)]
    pub async fn write_many<S: AsRef<str>>(&self, names: &[S]) -> Vec<OwnedRwLockWriteGuard<()>> {
        let mut indices: Vec<usize> = names.iter().map(|n| stripe_index(n.as_ref())).collect();
        indices.sort_unstable();
        indices.dedup();
        let mut guards = Vec::with_capacity(indices.len());
        for index in indices {
            guards.push(Arc::clone(&self.stripes[index]).write_owned().await);
        }
        guards
    }
}
