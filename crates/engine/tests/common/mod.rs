//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use warden_directory::SecretString;
use warden_directory::testing::MockDirectory;
use warden_engine::{EngineSettings, MemoryStorage, MountConfig, ReplicationState, SecretsEngine};

pub const BASE: &str = "dc=example,dc=com";
pub const USERS: &str = "ou=users,dc=example,dc=com";
pub const BIND_DN: &str = "cn=admin,dc=example,dc=com";
pub const BIND_PW: &str = "admin-password";

/// DN of a user entry in the fixture directory
pub fn user_dn(cn: &str) -> String {
    format!("cn={cn},{USERS}")
}

pub fn init_logging() {
    let config = warden_log::LogConfig {
        level: "off".to_string(),
        ..warden_log::LogConfig::default()
    };
    // a previous test may have installed the subscriber already
    let _ = warden_log::init(&config);
}

/// Directory with the admin account and the given users under `ou=users`
pub fn directory(users: &[&str]) -> MockDirectory {
    let mut mock = MockDirectory::new().with_user(BIND_DN, "cn", "admin", BIND_PW);
    for user in users {
        mock = mock.with_user(&user_dn(user), "cn", user, "initial-password");
    }
    mock
}

pub fn mount_config() -> MountConfig {
    let mut config = MountConfig::default();
    config.directory.url = "ldap://ldap.example.com".to_string();
    config.directory.binddn = BIND_DN.to_string();
    config.directory.bindpass = SecretString::new(BIND_PW);
    config.directory.userdn = USERS.to_string();
    config.directory.userattr = "cn".to_string();
    config.ttl = Duration::from_secs(3600);
    config.max_ttl = Duration::from_secs(7200);
    config
}

/// Settings that keep the background ticker out of the way; tests drive
/// rotation with `run_due_rotations`
pub fn settings() -> EngineSettings {
    EngineSettings {
        tick_interval: Duration::from_secs(3600),
        ..EngineSettings::default()
    }
}

pub struct Harness {
    pub engine: SecretsEngine,
    pub storage: MemoryStorage,
    pub directory: MockDirectory,
}

impl Harness {
    /// Configured primary engine over a fresh store
    pub async fn new(users: &[&str]) -> Self {
        Self::with_settings(users, settings()).await
    }

    pub async fn with_settings(users: &[&str], settings: EngineSettings) -> Self {
        init_logging();
        let storage = MemoryStorage::new();
        let directory = directory(users);
        let engine = start(&storage, &directory, settings).await;
        engine.write_config(mount_config()).await.unwrap();
        Self {
            engine,
            storage,
            directory,
        }
    }

    /// Tear the engine down and bring up a new one over the same state
    pub async fn restart(&mut self) {
        self.engine.teardown().await;
        self.engine = start(&self.storage, &self.directory, settings()).await;
    }
}

pub async fn start(
    storage: &MemoryStorage,
    directory: &MockDirectory,
    settings: EngineSettings,
) -> SecretsEngine {
    let engine = SecretsEngine::new(
        Arc::new(storage.clone()),
        Arc::new(directory.clone()),
        settings,
    );
    engine.initialize(ReplicationState::Primary).await.unwrap();
    engine
}

/// WAL keys left in the store
pub fn wal_keys(storage: &MemoryStorage) -> Vec<String> {
    storage
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("wal/"))
        .collect()
}
