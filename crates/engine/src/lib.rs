//! Warden Engine - directory secrets engine
//!
//! Issues and rotates credentials for accounts in an LDAP or Active
//! Directory server on behalf of a host that provides storage.
//!
//! # Features
//!
//! - **Static roles** - one directory account per role, rotated on a fixed period
//! - **Check-out libraries** - pools of accounts lent to one borrower at a time
//! - **Dynamic leases** - accounts created and removed by templated LDIF
//! - **Root rotation** - the mount's own bind password, with rollback
//! - **Crash safety** - write-ahead entries replayed at initialisation
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_directory::LdapConnector;
//! use warden_engine::{EngineSettings, MemoryStorage, ReplicationState, SecretsEngine};
//!
//! # async fn run() -> warden_engine::Result<()> {
//! let engine = SecretsEngine::new(
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(LdapConnector::new()),
//!     EngineSettings::default(),
//! );
//! engine.initialize(ReplicationState::Primary).await?;
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![forbid(unsafe_code)]

/// Mount configuration and process settings
pub mod config;
/// Cached password records
pub mod creds;
/// Error types
pub mod error;
/// Striped per-name locks
pub mod locks;
/// Roles, sets, leases and credential records
pub mod model;
/// Password generation
pub mod password;
/// Rotation priority queue
pub mod queue;
/// Managed-user ownership
pub mod registry;
/// Host storage abstraction and write-ahead log
pub mod storage;

mod engine;
mod rotation;

// ── Root re-exports ─────────────────────────────────────────────────────────

pub use crate::config::{EngineSettings, MountConfig, ReplicationState, RollbackPolicy};
pub use crate::creds::{CacheStats, CredentialStore};
pub use crate::engine::SecretsEngine;
pub use crate::engine::library::CheckInWal;
pub use crate::error::{EngineError, ErrorKind, Owner, Result};
pub use crate::model::{
    AccountStatus, Borrower, CheckOut, CheckedOutCredentials, DynamicCredentials,
    DynamicLeaseState, DynamicRole, LibrarySet, Lease, StaticCredentials, StaticRole,
    StaticRoleRequest, TemplateData,
};
pub use crate::password::{PasswordPolicies, StaticPasswordPolicies};
pub use crate::rotation::RotationWal;
pub use crate::storage::{MemoryStorage, Storage, StorageError};
