//! Mount configuration, initialisation and replication behaviour.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use warden_directory::SecretString;
use warden_directory::testing::MockOp;
use warden_engine::{
    ErrorKind, LibrarySet, MemoryStorage, ReplicationState, SecretsEngine, StaticPasswordPolicies,
    StaticRoleRequest,
};

use common::{Harness, directory, mount_config, settings, start, user_dn, wal_keys};

fn role(username: &str) -> StaticRoleRequest {
    StaticRoleRequest {
        username: Some(username.to_string()),
        rotation_period: Some(Duration::from_secs(3600)),
        ..StaticRoleRequest::default()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn operations_need_a_configuration() {
    common::init_logging();
    let storage = MemoryStorage::new();
    let engine = start(&storage, &directory(&["svc_app"]), settings()).await;

    let err = engine.create_static_role("app1", role("svc_app")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert!(engine.read_config().await.unwrap().is_none());
}

#[tokio::test]
async fn invalid_configurations_are_rejected() {
    let h = Harness::new(&[]).await;

    let mut inverted = mount_config();
    inverted.ttl = Duration::from_secs(600);
    inverted.max_ttl = Duration::from_secs(60);
    let err = h.engine.write_config(inverted).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let mut short = mount_config();
    short.length = 10;
    let err = h.engine.write_config(short).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let mut mixed = mount_config();
    mixed.password_policy = "strong".to_string();
    mixed.formatter = "pre{{PASSWORD}}".to_string();
    let err = h.engine.write_config(mixed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let mut no_url = mount_config();
    no_url.directory.url = String::new();
    let err = h.engine.write_config(no_url).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

#[tokio::test]
async fn rewriting_a_read_config_keeps_secrets() {
    let h = Harness::new(&["svc_app"]).await;

    let mut read = h.engine.read_config().await.unwrap().unwrap();
    assert!(read.directory.bindpass.is_empty());
    read.ttl = Duration::from_secs(1800);
    h.engine.write_config(read).await.unwrap();

    // binding still works, so the stored password survived
    h.engine.create_static_role("app1", role("svc_app")).await.unwrap();
    let reread = h.engine.read_config().await.unwrap().unwrap();
    assert_eq!(reread.ttl, Duration::from_secs(1800));
}

#[tokio::test]
async fn formatter_shapes_generated_passwords() {
    let h = Harness::new(&["svc_app"]).await;
    let mut config = mount_config();
    config.length = 20;
    config.formatter = "pfx-{{PASSWORD}}".to_string();
    h.engine.write_config(config).await.unwrap();

    h.engine.create_static_role("app1", role("svc_app")).await.unwrap();
    let creds = h.engine.read_static_credentials("app1").await.unwrap();
    let password = creds.password.expose_secret();
    assert!(password.starts_with("pfx-"), "{password}");
    assert_eq!(password.len(), 20);
}

#[tokio::test]
async fn named_policy_is_resolved_by_host() {
    common::init_logging();
    let storage = MemoryStorage::new();
    let mock = directory(&["svc_app"]);
    let engine = SecretsEngine::with_password_policies(
        Arc::new(storage.clone()),
        Arc::new(mock.clone()),
        Arc::new(StaticPasswordPolicies::new("Policy-Generated-1")),
        settings(),
    );
    engine.initialize(ReplicationState::Primary).await.unwrap();
    let mut config = mount_config();
    config.password_policy = "strong".to_string();
    engine.write_config(config).await.unwrap();

    engine.create_static_role("app1", role("svc_app")).await.unwrap();
    assert_eq!(
        mock.password_of(&user_dn("svc_app")).as_deref(),
        Some("Policy-Generated-1")
    );
    engine.teardown().await;
}

#[tokio::test]
async fn policy_without_host_support_fails() {
    let h = Harness::new(&["svc_app"]).await;
    let mut config = mount_config();
    config.password_policy = "strong".to_string();
    h.engine.write_config(config).await.unwrap();

    let err = h.engine.create_static_role("app1", role("svc_app")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

// ---------------------------------------------------------------------------
// Initialisation and replication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_keeps_identities_managed() {
    let mut h = Harness::new(&["svc_app", "a"]).await;
    h.engine.create_static_role("app1", role("svc_app")).await.unwrap();
    h.engine
        .create_library_set(LibrarySet::new("team", ["a"]))
        .await
        .unwrap();

    h.restart().await;

    let err = h
        .engine
        .create_library_set(LibrarySet::new("other", ["svc_app"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManagedElsewhere);
    let err = h.engine.create_static_role("app2", role("a")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManagedElsewhere);
    assert!(h.engine.scheduled_rotation("app1").is_some());
}

#[tokio::test]
async fn standby_leaves_wal_for_primary() {
    let h = Harness::new(&["svc_app"]).await;
    h.engine.create_static_role("app1", role("svc_app")).await.unwrap();
    h.directory.fail(MockOp::Modify, Some(&user_dn("svc_app")), 1);
    h.engine.rotate_role("app1").await.unwrap_err();
    h.engine.teardown().await;
    assert_eq!(wal_keys(&h.storage).len(), 1);

    let standby = SecretsEngine::new(
        Arc::new(h.storage.clone()),
        Arc::new(h.directory.clone()),
        settings(),
    );
    standby.initialize(ReplicationState::Standby).await.unwrap();
    assert_eq!(wal_keys(&h.storage).len(), 1);
    assert!(standby.scheduled_rotation("app1").is_some());
    standby.teardown().await;

    let primary = start(&h.storage, &h.directory, settings()).await;
    primary.run_due_rotations().await;
    assert!(wal_keys(&h.storage).is_empty());
    primary.teardown().await;
}

#[tokio::test]
async fn torn_down_engine_refuses_role_writes() {
    let h = Harness::new(&["svc_app"]).await;
    h.engine.teardown().await;

    let err = h.engine.create_static_role("app1", role("svc_app")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[tokio::test]
async fn credential_reads_are_cached() {
    let h = Harness::new(&["svc_app"]).await;
    h.engine.create_static_role("app1", role("svc_app")).await.unwrap();
    let before = h.engine.credential_store().stats();

    for _ in 0..3 {
        h.engine.read_static_credentials("app1").await.unwrap();
    }

    let after = h.engine.credential_store().stats();
    assert!(after.hits >= before.hits + 2, "{before:?} -> {after:?}");
}

#[test]
fn secret_strings_never_print() {
    let secret = SecretString::new("hunter2");
    assert!(!format!("{secret:?}").contains("hunter2"));
    assert!(!format!("{secret}").contains("hunter2"));
}
