//! Secrets engine
//!
//! [`SecretsEngine`] is the mount: it owns the configuration, the rotation
//! queue, the lock table, the managed-user set and the credential cache.
//! Handles are cheap to clone and share one state.
//!
//! Lock order, outermost first: lock table stripe, configuration lock,
//! managed-user set. The root rotation path only takes the configuration
//! lock, for writing.

mod dynamic;
pub(crate) mod library;
mod static_roles;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::RwLockReadGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_directory::{Directory, DirectoryConnector, SecretString};

use crate::config::{EngineSettings, MountConfig, ReplicationState};
use crate::creds::CredentialStore;
use crate::error::{EngineError, Owner, Result};
use crate::locks::LockTable;
use crate::model::{LibrarySet, StaticRole};
use crate::password::{self, PasswordPolicies};
use crate::queue::PriorityQueue;
use crate::registry::ManagedUsers;
use crate::storage::{Storage, get_json, keys, list_recursive, put_json};

pub(crate) struct Inner {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) directory: Directory,
    pub(crate) policies: Option<Arc<dyn PasswordPolicies>>,
    pub(crate) settings: EngineSettings,
    pub(crate) config: tokio::sync::RwLock<Option<MountConfig>>,
    pub(crate) root_rotation: AtomicBool,
    pub(crate) queue: RwLock<Option<Arc<PriorityQueue>>>,
    pub(crate) locks: LockTable,
    pub(crate) managed: ManagedUsers,
    pub(crate) creds: CredentialStore,
    pub(crate) cancel: Mutex<CancellationToken>,
    pub(crate) ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Directory secrets engine
#[derive(Clone)]
pub struct SecretsEngine {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for SecretsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsEngine")
            .field("settings", &self.inner.settings)
            .field("queued", &self.queue().map(|q| q.len()))
            .finish_non_exhaustive()
    }
}

impl SecretsEngine {
    /// Engine over host storage and a directory connector
    pub fn new(
        storage: Arc<dyn Storage>,
        connector: Arc<dyn DirectoryConnector>,
        settings: EngineSettings,
    ) -> Self {
        Self::build(storage, connector, None, settings)
    }

    /// Engine that resolves named password policies through `policies`
    pub fn with_password_policies(
        storage: Arc<dyn Storage>,
        connector: Arc<dyn DirectoryConnector>,
        policies: Arc<dyn PasswordPolicies>,
        settings: EngineSettings,
    ) -> Self {
        Self::build(storage, connector, Some(policies), settings)
    }

    fn build(
        storage: Arc<dyn Storage>,
        connector: Arc<dyn DirectoryConnector>,
        policies: Option<Arc<dyn PasswordPolicies>>,
        settings: EngineSettings,
    ) -> Self {
        let creds = CredentialStore::new(Arc::clone(&storage), settings.cache_ttl);
        Self {
            inner: Arc::new(Inner {
                storage,
                directory: Directory::new(connector),
                policies,
                settings,
                config: tokio::sync::RwLock::new(None),
                root_rotation: AtomicBool::new(false),
                queue: RwLock::new(None),
                locks: LockTable::new(),
                managed: ManagedUsers::new(),
                creds,
                cancel: Mutex::new(CancellationToken::new()),
                ticker: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_weak(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    /// Process settings
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Credential store backing static and library reads
    pub fn credential_store(&self) -> &CredentialStore {
        &self.inner.creds
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Load state from storage and start background work
    ///
    /// Every node rebuilds the managed-user set and the rotation queue. Only
    /// the primary replays WAL entries and runs the ticker.
    pub async fn initialize(&self, state: ReplicationState) -> Result<()> {
        self.stop_ticker().await;

        let config: Option<MountConfig> = get_json(self.storage(), keys::CONFIG).await?;
        *self.inner.config.write().await = config;

        self.rebuild_managed().await?;

        let queue = Arc::new(PriorityQueue::new());
        *self.inner.queue.write() = Some(Arc::clone(&queue));

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();

        if state.is_primary() {
            self.recover(&queue).await?;
            let handle = tokio::spawn(crate::rotation::run_ticker(self.downgrade(), cancel));
            *self.inner.ticker.lock() = Some(handle);
        } else {
            self.load_queue(&queue, &std::collections::HashMap::new()).await?;
        }

        info!(?state, queued = queue.len(), "secrets engine initialized");
        Ok(())
    }

    /// Stop background work and drop in-memory state
    pub async fn teardown(&self) {
        self.stop_ticker().await;
        *self.inner.queue.write() = None;
        self.inner.managed.lock().await.clear();
        self.inner.creds.clear();
        info!("secrets engine torn down");
    }

    async fn stop_ticker(&self) {
        self.inner.cancel.lock().cancel();
        let handle = self.inner.ticker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "rotation ticker ended abnormally");
        }
    }

    async fn rebuild_managed(&self) -> Result<()> {
        let mut managed = self.inner.managed.lock().await;
        managed.clear();
        for name in list_recursive(self.storage(), keys::STATIC_ROLE).await? {
            if let Some(role) = self.static_role(&name).await? {
                managed.insert(&role.username, Owner::StaticRole(name));
            }
        }
        for name in list_recursive(self.storage(), keys::LIBRARY).await? {
            if let Some(set) = self.library(&name).await? {
                for account in &set.service_account_names {
                    managed.insert(account, Owner::Library(name.clone()));
                }
            }
        }
        Ok(())
    }

    // ── Configuration ──────────────────────────────────────────────────────

    /// Validate, persist and apply a mount configuration
    ///
    /// An empty `bindpass` or `client_tls_key` keeps the stored value, so a
    /// configuration read back (secrets redacted) can be written again.
    pub async fn write_config(&self, mut config: MountConfig) -> Result<()> {
        let mut current = self.inner.config.write().await;
        if let Some(existing) = current.as_ref() {
            if config.directory.bindpass.is_empty() {
                config.directory.bindpass = existing.directory.bindpass.clone();
            }
            if config.directory.client_tls_key.is_empty() {
                config.directory.client_tls_key = existing.directory.client_tls_key.clone();
            }
        }
        config.validate()?;
        put_json(self.storage(), keys::CONFIG, &config).await?;
        *current = Some(config);
        info!("mount configuration updated");
        Ok(())
    }

    /// Current configuration with secrets blanked
    pub async fn read_config(&self) -> Result<Option<MountConfig>> {
        Ok(self.inner.config.read().await.as_ref().map(MountConfig::redacted))
    }

    /// Remove the configuration
    pub async fn delete_config(&self) -> Result<()> {
        let mut current = self.inner.config.write().await;
        self.storage().delete(keys::CONFIG).await?;
        *current = None;
        info!("mount configuration deleted");
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────────────────────

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.inner.storage.as_ref()
    }

    pub(crate) fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    /// Shared configuration guard; fails when the mount is unconfigured
    pub(crate) async fn config_guard(&self) -> Result<ConfigGuard<'_>> {
        let guard = self.inner.config.read().await;
        if guard.is_none() {
            return Err(EngineError::NotConfigured);
        }
        Ok(ConfigGuard { guard })
    }

    pub(crate) fn queue(&self) -> Option<Arc<PriorityQueue>> {
        self.inner.queue.read().clone()
    }

    pub(crate) fn require_queue(&self) -> Result<Arc<PriorityQueue>> {
        self.queue()
            .ok_or_else(|| EngineError::Internal("secrets engine is not initialized".to_string()))
    }

    pub(crate) async fn generate_password(&self, config: &MountConfig) -> Result<SecretString> {
        password::generate(config, self.inner.policies.as_deref()).await
    }

    pub(crate) async fn static_role(&self, name: &str) -> Result<Option<StaticRole>> {
        Ok(get_json(self.storage(), &keys::key(keys::STATIC_ROLE, name)).await?)
    }

    pub(crate) async fn library(&self, name: &str) -> Result<Option<LibrarySet>> {
        Ok(get_json(self.storage(), &keys::key(keys::LIBRARY, name)).await?)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.lock().clone()
    }

    pub(crate) fn root_rotation_flag(&self) -> Option<RootRotationFlag<'_>> {
        RootRotationFlag::acquire(&self.inner.root_rotation)
    }
}

/// Read guard over a present configuration
pub(crate) struct ConfigGuard<'a> {
    guard: RwLockReadGuard<'a, Option<MountConfig>>,
}

impl ConfigGuard<'_> {
    pub(crate) fn get(&self) -> Result<&MountConfig> {
        self.guard.as_ref().ok_or(EngineError::NotConfigured)
    }
}

/// Single-writer marker for root rotation; cleared on drop
pub(crate) struct RootRotationFlag<'a>(&'a AtomicBool);

impl<'a> RootRotationFlag<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RootRotationFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
        debug!("root rotation flag cleared");
    }
}
