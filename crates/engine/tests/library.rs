//! Check-out library behaviour.
//!
//! Ordered check-out, borrower enforcement on check-in, lease renewal and
//! revocation, membership changes and replay of an interrupted check-in.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::task::JoinSet;
use warden_directory::testing::MockOp;
use warden_engine::{Borrower, ErrorKind, LibrarySet, StaticRoleRequest, Storage};

use common::{Harness, user_dn, wal_keys};

fn team() -> LibrarySet {
    LibrarySet {
        ttl: Duration::from_secs(30),
        ..LibrarySet::new("team", ["a", "b", "c"])
    }
}

fn alice() -> Borrower {
    Borrower::new("entity-alice", "token-alice")
}

fn bob() -> Borrower {
    Borrower::new("entity-bob", "token-bob")
}

// ---------------------------------------------------------------------------
// Check-out cycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn check_out_follows_configured_order() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    for account in ["a", "b", "c"] {
        assert_eq!(h.directory.accepted_password_changes(&user_dn(account)), 1);
    }

    let first = h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();
    let second = h.engine.check_out("team", &bob(), Duration::ZERO).await.unwrap();
    assert_eq!(first.service_account_name, "a");
    assert_eq!(second.service_account_name, "b");
    assert_eq!(first.lease.ttl, Duration::from_secs(30));
    assert_eq!(
        h.directory.password_of(&user_dn("a")).as_deref(),
        Some(first.password.expose_secret())
    );

    let returned = h
        .engine
        .check_in("team", Some(vec!["a".to_string()]), &alice())
        .await
        .unwrap();
    assert_eq!(returned, vec!["a".to_string()]);
    assert_eq!(h.directory.accepted_password_changes(&user_dn("a")), 2);
    assert_ne!(
        h.directory.password_of(&user_dn("a")).as_deref(),
        Some(first.password.expose_secret())
    );

    let status = h.engine.library_status("team").await.unwrap();
    assert!(status[0].available);
    assert!(!status[1].available);
    assert_eq!(status[1].borrower_entity_id, "entity-bob");
    assert!(status[2].available);
    assert!(wal_keys(&h.storage).is_empty());
}

#[tokio::test]
async fn requested_ttl_is_capped_by_set() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();

    let short = h
        .engine
        .check_out("team", &alice(), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(short.lease.ttl, Duration::from_secs(10));
    let long = h
        .engine
        .check_out("team", &bob(), Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(long.lease.ttl, Duration::from_secs(30));
}

#[tokio::test]
async fn exhausted_set_reports_no_accounts() {
    let h = Harness::new(&["a"]).await;
    h.engine
        .create_library_set(LibrarySet::new("solo", ["a"]))
        .await
        .unwrap();

    h.engine.check_out("solo", &alice(), Duration::ZERO).await.unwrap();
    let err = h
        .engine
        .check_out("solo", &bob(), Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoAccountsAvailable);
}

#[tokio::test]
async fn concurrent_check_outs_never_share_an_account() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();

    let mut tasks = JoinSet::new();
    for i in 0..8 {
        let engine = h.engine.clone();
        tasks.spawn(async move {
            let borrower = Borrower::new(format!("entity-{i}"), format!("token-{i}"));
            engine.check_out("team", &borrower, Duration::ZERO).await
        });
    }

    let mut granted = Vec::new();
    let mut refused = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(creds) => granted.push(creds.service_account_name),
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::NoAccountsAvailable);
                refused += 1;
            }
        }
    }
    let distinct: HashSet<_> = granted.iter().collect();
    assert_eq!(granted.len(), 3);
    assert_eq!(distinct.len(), 3);
    assert_eq!(refused, 5);
}

// ---------------------------------------------------------------------------
// Check-in rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn only_the_borrower_may_check_in() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    let err = h
        .engine
        .check_in("team", Some(vec!["a".to_string()]), &bob())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CheckInUnauthorized);

    // same token, different entity still counts as the borrower
    let token_only = Borrower::new("", "token-alice");
    let returned = h.engine.check_in("team", None, &token_only).await.unwrap();
    assert_eq!(returned, vec!["a".to_string()]);
}

#[tokio::test]
async fn operator_check_in_ignores_borrower() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();
    h.engine.check_out("team", &bob(), Duration::ZERO).await.unwrap();

    let mut returned = h
        .engine
        .manage_check_in("team", Some(vec!["b".to_string(), "a".to_string(), "b".to_string()]))
        .await
        .unwrap();
    returned.sort();
    assert_eq!(returned, vec!["a".to_string(), "b".to_string()]);
    assert!(h.engine.library_status("team").await.unwrap().iter().all(|s| s.available));
}

#[tokio::test]
async fn automatic_check_in_needs_a_single_candidate() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    let err = h.engine.check_in("team", None, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let nothing = h.engine.check_in("team", None, &bob()).await.unwrap();
    assert!(nothing.is_empty());

    let stranger = h
        .engine
        .check_in("team", Some(vec!["zed".to_string()]), &alice())
        .await
        .unwrap_err();
    assert_eq!(stranger.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn disabled_enforcement_lets_anyone_check_in() {
    let h = Harness::new(&["a"]).await;
    h.engine
        .create_library_set(LibrarySet {
            disable_check_in_enforcement: true,
            ..LibrarySet::new("open", ["a"])
        })
        .await
        .unwrap();
    h.engine.check_out("open", &alice(), Duration::ZERO).await.unwrap();

    let returned = h.engine.check_in("open", None, &bob()).await.unwrap();
    assert_eq!(returned, vec!["a".to_string()]);
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn renew_and_revoke() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    let lease = h.engine.renew_check_out("team", "a").await.unwrap();
    assert_eq!(lease.ttl, Duration::from_secs(30));

    h.engine.revoke_check_out("team", "a").await.unwrap();
    assert_eq!(h.directory.accepted_password_changes(&user_dn("a")), 2);

    let err = h.engine.renew_check_out("team", "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyCheckedIn);

    // revoking again is a no-op
    h.engine.revoke_check_out("team", "a").await.unwrap();
    assert_eq!(h.directory.accepted_password_changes(&user_dn("a")), 2);
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[tokio::test]
async fn static_role_identity_cannot_join_a_library() {
    let h = Harness::new(&["svc_app", "a"]).await;
    h.engine
        .create_static_role(
            "app1",
            StaticRoleRequest {
                username: Some("svc_app".to_string()),
                rotation_period: Some(Duration::from_secs(60)),
                skip_import_rotation: Some(true),
                ..StaticRoleRequest::default()
            },
        )
        .await
        .unwrap();

    let err = h
        .engine
        .create_library_set(LibrarySet::new("team", ["a", "svc_app"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManagedElsewhere);
    assert!(h.engine.read_library_set("team").await.unwrap().is_none());
    assert!(h.directory.password_changes(&user_dn("a")).is_empty());

    // and the other way round
    h.engine
        .create_library_set(LibrarySet::new("team", ["a"]))
        .await
        .unwrap();
    let err = h
        .engine
        .create_static_role(
            "app2",
            StaticRoleRequest {
                username: Some("a".to_string()),
                rotation_period: Some(Duration::from_secs(60)),
                ..StaticRoleRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManagedElsewhere);
}

#[tokio::test]
async fn update_adds_and_removes_accounts() {
    let h = Harness::new(&["a", "b", "c", "d"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    let drop_a = LibrarySet {
        ttl: Duration::from_secs(30),
        ..LibrarySet::new("team", ["b", "c", "d"])
    };
    let err = h.engine.update_library_set(drop_a.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CheckedOut);

    h.engine.manage_check_in("team", None).await.unwrap();
    h.engine.update_library_set(drop_a).await.unwrap();

    let status = h.engine.library_status("team").await.unwrap();
    let names: Vec<_> = status.iter().map(|s| s.service_account_name.as_str()).collect();
    assert_eq!(names, vec!["b", "c", "d"]);
    assert!(!h.storage.keys().contains(&"checkout/a".to_string()));
    assert!(!h.storage.keys().contains(&"password/a".to_string()));

    // a is free for another set now
    h.engine
        .create_library_set(LibrarySet::new("other", ["a"]))
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_update_leaves_membership_untouched() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine
        .create_library_set(LibrarySet::new("team", ["a"]))
        .await
        .unwrap();

    h.directory.fail(MockOp::Modify, Some(&user_dn("c")), 1);
    h.engine
        .update_library_set(LibrarySet::new("team", ["a", "b", "c"]))
        .await
        .unwrap_err();

    let stored = h.engine.read_library_set("team").await.unwrap().unwrap();
    assert_eq!(stored.service_account_names, vec!["a".to_string()]);
    let keys = h.storage.keys();
    for account in ["b", "c"] {
        assert!(!keys.contains(&format!("checkout/{account}")), "{keys:?}");
        assert!(!keys.contains(&format!("password/{account}")), "{keys:?}");
    }
    assert!(wal_keys(&h.storage).is_empty());

    // b and c were never taken over
    h.engine
        .create_static_role(
            "app1",
            StaticRoleRequest {
                username: Some("b".to_string()),
                rotation_period: Some(Duration::from_secs(60)),
                ..StaticRoleRequest::default()
            },
        )
        .await
        .unwrap();
    h.engine
        .create_library_set(LibrarySet::new("other", ["c"]))
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_refuses_while_checked_out() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    let err = h.engine.delete_library_set("team").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CheckedOut);

    h.engine.check_in("team", None, &alice()).await.unwrap();
    h.engine.delete_library_set("team").await.unwrap();
    h.engine.delete_library_set("team").await.unwrap();
    assert!(h.engine.list_library_sets("").await.unwrap().is_empty());
    assert!(!h.storage.keys().iter().any(|k| k.starts_with("checkout/")));
}

#[tokio::test]
async fn invalid_sets_are_rejected() {
    let h = Harness::new(&["a"]).await;
    let empty = h
        .engine
        .create_library_set(LibrarySet::new("none", Vec::<String>::new()))
        .await
        .unwrap_err();
    assert_eq!(empty.kind(), ErrorKind::InvalidRequest);

    let inverted = h
        .engine
        .create_library_set(LibrarySet {
            ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(30),
            ..LibrarySet::new("bad", ["a"])
        })
        .await
        .unwrap_err();
    assert_eq!(inverted.kind(), ErrorKind::InvalidRequest);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupted_check_in_is_replayed_on_restart() {
    let mut h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    h.storage.fail_puts("checkout/a", 1);
    h.engine.check_in("team", None, &alice()).await.unwrap_err();
    assert_eq!(wal_keys(&h.storage).len(), 1);
    let candidate = h.directory.password_of(&user_dn("a")).unwrap();

    h.restart().await;

    assert!(wal_keys(&h.storage).is_empty());
    let status = h.engine.library_status("team").await.unwrap();
    assert!(status[0].available);
    let changes = h.directory.password_changes(&user_dn("a"));
    assert_eq!(changes.last().unwrap().1, candidate);

    let next = h.engine.check_out("team", &bob(), Duration::ZERO).await.unwrap();
    assert_eq!(next.service_account_name, "a");
    assert_eq!(next.password.expose_secret(), candidate);
}

#[tokio::test]
async fn failed_check_in_retries_with_same_candidate() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    h.directory.fail(MockOp::Modify, Some(&user_dn("a")), 1);
    h.engine.check_in("team", None, &alice()).await.unwrap_err();
    assert_eq!(wal_keys(&h.storage).len(), 1);

    let returned = h.engine.check_in("team", None, &alice()).await.unwrap();
    assert_eq!(returned, vec!["a".to_string()]);

    let changes = h.directory.password_changes(&user_dn("a"));
    let [.., (_, refused, false), (_, accepted, true)] = changes.as_slice() else {
        panic!("unexpected password changes: {changes:?}");
    };
    assert_eq!(accepted, refused);
    assert!(wal_keys(&h.storage).is_empty());
    assert!(h.engine.library_status("team").await.unwrap()[0].available);
}

#[tokio::test]
async fn revoke_reuses_candidate_of_failed_check_in() {
    let h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    h.storage.fail_puts("password/a", 1);
    h.engine.check_in("team", None, &alice()).await.unwrap_err();
    let candidate = h.directory.password_of(&user_dn("a")).unwrap();

    h.engine.revoke_check_out("team", "a").await.unwrap();

    assert_eq!(h.directory.password_of(&user_dn("a")).unwrap(), candidate);
    assert!(wal_keys(&h.storage).is_empty());
    let next = h.engine.check_out("team", &bob(), Duration::ZERO).await.unwrap();
    assert_eq!(next.service_account_name, "a");
    assert_eq!(next.password.expose_secret(), candidate);
}

#[tokio::test]
async fn stale_check_in_wal_never_releases_a_later_borrower() {
    let mut h = Harness::new(&["a", "b", "c"]).await;
    h.engine.create_library_set(team()).await.unwrap();
    h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();

    h.storage.fail_puts("checkout/a", 1);
    h.engine.check_in("team", None, &alice()).await.unwrap_err();
    let wal_key = wal_keys(&h.storage).pop().unwrap();
    let leftover = h.storage.get(&wal_key).await.unwrap().unwrap();

    h.engine.check_in("team", None, &alice()).await.unwrap();
    assert!(wal_keys(&h.storage).is_empty());
    let held = h.engine.check_out("team", &bob(), Duration::ZERO).await.unwrap();
    assert_eq!(held.service_account_name, "a");

    // the entry of the finished check-in reappears, as if its delete was lost
    h.storage.put(&wal_key, leftover).await.unwrap();
    let changes_before = h.directory.password_changes(&user_dn("a")).len();

    h.restart().await;

    assert!(wal_keys(&h.storage).is_empty());
    assert_eq!(h.directory.password_changes(&user_dn("a")).len(), changes_before);
    let status = h.engine.library_status("team").await.unwrap();
    assert!(!status[0].available);
    assert_eq!(status[0].borrower_entity_id, "entity-bob");
    assert_eq!(
        h.directory.password_of(&user_dn("a")).as_deref(),
        Some(held.password.expose_secret())
    );

    let next = h.engine.check_out("team", &alice(), Duration::ZERO).await.unwrap();
    assert_eq!(next.service_account_name, "b");
}
