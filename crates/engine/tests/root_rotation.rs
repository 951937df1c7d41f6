//! Root credential rotation and its rollback schedule.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use warden_engine::{EngineError, ErrorKind, MountConfig, Storage};

use common::{BIND_DN, BIND_PW, Harness};

async fn stored_bindpass(h: &Harness) -> String {
    let raw = h.storage.get("config").await.unwrap().unwrap();
    let config: MountConfig = serde_json::from_slice(&raw).unwrap();
    config.directory.bindpass.expose_secret().to_string()
}

#[tokio::test]
async fn rotation_persists_new_bind_password() {
    let h = Harness::new(&["svc_app"]).await;

    h.engine.rotate_root().await.unwrap();

    let current = h.directory.password_of(BIND_DN).unwrap();
    assert_ne!(current, BIND_PW);
    assert_eq!(stored_bindpass(&h).await, current);

    // later operations bind with the new password
    h.engine.rotate_root().await.unwrap();
    assert_eq!(h.directory.accepted_password_changes(BIND_DN), 2);

    let read = h.engine.read_config().await.unwrap().unwrap();
    assert!(read.directory.bindpass.is_empty());
}

#[tokio::test]
async fn storage_failure_restores_old_password() {
    let h = Harness::new(&[]).await;
    h.storage.fail_puts("config", 1);

    let err = h.engine.rotate_root().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageFailure);

    assert_eq!(h.directory.password_of(BIND_DN).as_deref(), Some(BIND_PW));
    assert_eq!(stored_bindpass(&h).await, BIND_PW);
    let changes = h.directory.password_changes(BIND_DN);
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].1, BIND_PW);

    // in-memory config still carries the old password
    h.engine.rotate_root().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rollback_backs_off_quadratically() {
    let h = Harness::new(&[]).await;
    h.storage.fail_puts("config", 1);
    h.directory.fail_password_change_to(BIND_DN, BIND_PW, 10);

    let err = h.engine.rotate_root().await.unwrap_err();
    match &err {
        EngineError::RollbackFailed { attempts, .. } => assert_eq!(*attempts, 10),
        other => panic!("expected RollbackFailed, got {other:?}"),
    }

    let changes = h.directory.password_changes(BIND_DN);
    assert_eq!(changes.len(), 11);
    assert!(changes[0].2, "the rotation itself was accepted");
    let rollbacks = &changes[1..];
    assert!(rollbacks.iter().all(|(_, pw, ok)| pw == BIND_PW && !ok));

    assert!(rollbacks[0].0 - changes[0].0 < Duration::from_millis(10));
    for i in 1..rollbacks.len() {
        let waited = rollbacks[i].0 - rollbacks[i - 1].0;
        let expected = Duration::from_secs((i * i) as u64);
        assert!(
            waited >= expected && waited < expected + Duration::from_millis(10),
            "attempt {i}: waited {waited:?}, expected {expected:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_rollback() {
    let h = Harness::new(&[]).await;
    h.storage.fail_puts("config", 1);
    h.directory.fail_password_change_to(BIND_DN, BIND_PW, 10);

    let engine = h.engine.clone();
    let rotation = tokio::spawn(async move { engine.rotate_root().await });
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.engine.teardown().await;

    let err = rotation.await.unwrap().unwrap_err();
    match err {
        EngineError::RollbackFailed {
            attempts,
            last_error,
            ..
        } => {
            assert!(attempts < 10);
            assert!(last_error.contains("canceled"), "{last_error}");
        }
        other => panic!("expected RollbackFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_rotations_serialize() {
    let h = Harness::new(&[]).await;
    h.directory.set_modify_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(h.engine.rotate_root(), h.engine.rotate_root());
    for outcome in [first, second] {
        match outcome {
            Ok(()) => {}
            Err(e) => assert_eq!(e.kind(), ErrorKind::RotationInProgress),
        }
    }

    let current = h.directory.password_of(BIND_DN).unwrap();
    assert_eq!(stored_bindpass(&h).await, current);
}

#[tokio::test]
async fn unconfigured_mount_cannot_rotate() {
    let h = Harness::new(&[]).await;
    h.engine.delete_config().await.unwrap();

    let err = h.engine.rotate_root().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}
