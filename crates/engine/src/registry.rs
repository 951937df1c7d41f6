//! Managed-user set
//!
//! Process-wide index of the directory identities owned by static roles and
//! library sets. Storage stays the source of truth: the index is rebuilt
//! from it on initialisation and cleared on teardown.

use std::collections::HashMap;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::{EngineError, Owner, Result};

/// Identity → owner map behind its own lock
#[derive(Debug, Default)]
pub struct ManagedUsers {
    owners: Mutex<HashMap<String, Owner>>,
}

impl ManagedUsers {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the set for a check-then-update sequence
    pub async fn lock(&self) -> ManagedGuard<'_> {
        ManagedGuard {
            owners: self.owners.lock().await,
        }
    }

    /// Owner of `username`, if any
    pub async fn owner(&self, username: &str) -> Option<Owner> {
        self.owners.lock().await.get(username).cloned()
    }

    /// Number of managed identities
    pub async fn len(&self) -> usize {
        self.owners.lock().await.len()
    }
}

/// Exclusive access to the managed-user set
#[derive(Debug)]
pub struct ManagedGuard<'a> {
    owners: MutexGuard<'a, HashMap<String, Owner>>,
}

impl ManagedGuard<'_> {
    /// Fail when `username` is owned by anyone other than `owner`
    pub fn ensure_available(&self, username: &str, owner: &Owner) -> Result<()> {
        match self.owners.get(username) {
            Some(current) if current != owner => Err(EngineError::ManagedElsewhere {
                username: username.to_string(),
                owner: current.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Record `owner` for `username`
    pub fn insert(&mut self, username: &str, owner: Owner) {
        self.owners.insert(username.to_string(), owner);
    }

    /// Forget `username` if `owner` holds it
    pub fn remove(&mut self, username: &str, owner: &Owner) {
        if self.owners.get(username) == Some(owner) {
            self.owners.remove(username);
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.owners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identities_have_one_owner() {
        let users = ManagedUsers::new();
        let role = Owner::StaticRole("app1".into());
        let team = Owner::Library("team".into());
        {
            let mut guard = users.lock().await;
            guard.ensure_available("svc_app", &role).unwrap();
            guard.insert("svc_app", role.clone());
            assert!(guard.ensure_available("svc_app", &role).is_ok());
            let err = guard.ensure_available("svc_app", &team).unwrap_err();
            assert!(matches!(err, EngineError::ManagedElsewhere { owner, .. } if owner == role));
            guard.remove("svc_app", &team);
        }
        assert_eq!(users.owner("svc_app").await, Some(role.clone()));
        users.lock().await.remove("svc_app", &role);
        assert_eq!(users.len().await, 0);
    }
}
