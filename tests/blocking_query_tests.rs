//! Integration tests for blocking queries: wake-ups on relevant writes,
//! timeouts, store replacement and shutdown.


use std::sync::Arc;
use std::time::Duration;

use nomad_control::error::ControlError;
use nomad_control::fsm::{Fsm, FsmConfig};
use nomad_control::raft::Command;
use nomad_control::structs::{AuthMethodListRequest, AuthMethodSpecificRequest};
use test_harness::{oidc_method, TestServer};
use tokio::time::Instant;

#[tokio::test]
async fn test_blocked_list_wakes_on_upsert() {
    let server = Arc::new(TestServer::start().await);
    let first = server
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .server
                .list_auth_methods(AuthMethodListRequest {
                    query: server.query().blocking(first, Duration::from_secs(10)),
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished(), "Query should block at an unchanged index");

    let second = server
        .upsert_method(oidc_method("auth0", "https://auth0.example.com"))
        .await;

    let resp = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("Blocked query should wake on the write")
        .unwrap()
        .unwrap();
    assert_eq!(resp.meta.index, second);
    assert_eq!(resp.auth_methods.len(), 2);
}

#[tokio::test]
async fn test_blocking_times_out_with_unchanged_index() {
    let server = TestServer::start().await;
    let index = server
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;

    let start = Instant::now();
    let resp = server
        .server
        .list_auth_methods(AuthMethodListRequest {
            query: server.query().blocking(index, Duration::from_millis(50)),
        })
        .await
        .unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(resp.meta.index, index);
    assert_eq!(resp.auth_methods.len(), 1);
}

#[tokio::test]
async fn test_unrelated_write_does_not_answer_query() {
    let server = Arc::new(TestServer::start().await);
    let index = server
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .server
                .list_auth_methods(AuthMethodListRequest {
                    query: server.query().blocking(index, Duration::from_millis(300)),
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.upsert_role("dev").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished(), "A role write should not answer an auth method query");

    let resp = waiter.await.unwrap().unwrap();
    assert_eq!(resp.meta.index, index);
}

#[tokio::test]
async fn test_get_blocks_until_method_appears() {
    let server = Arc::new(TestServer::start().await);
    let missing = server
        .server
        .get_auth_method(AuthMethodSpecificRequest {
            name: "okta".to_string(),
            query: server.query(),
        })
        .await
        .unwrap();
    assert!(missing.auth_method.is_none());

    let waiter = {
        let server = server.clone();
        let index = missing.meta.index;
        tokio::spawn(async move {
            server
                .server
                .get_auth_method(AuthMethodSpecificRequest {
                    name: "okta".to_string(),
                    query: server.query().blocking(index, Duration::from_secs(10)),
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let created = server
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;

    let resp = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(resp.meta.index, created);
    assert_eq!(resp.auth_method.unwrap().name, "okta");
}

#[tokio::test]
async fn test_restore_wakes_blocked_readers() {
    let server = Arc::new(TestServer::start().await);
    let index = server
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;

    // A snapshot from a store that has moved further ahead
    let source = Fsm::new(FsmConfig {
        region: "global".to_string(),
    });
    let mut restored = oidc_method("restored", "https://idp.example.com");
    restored.set_hash();
    source
        .apply(index + 10, &Command::UpsertAuthMethods(vec![restored]))
        .unwrap();
    let data = source.persist().unwrap();

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .server
                .list_auth_methods(AuthMethodListRequest {
                    query: server.query().blocking(index, Duration::from_secs(10)),
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.raft.restore(data, None).await.unwrap();

    let resp = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("Replacing the store should wake blocked readers")
        .unwrap()
        .unwrap();
    assert_eq!(resp.meta.index, index + 10);
    let names: Vec<_> = resp.auth_methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["restored"]);
}

#[tokio::test]
async fn test_shutdown_releases_blocked_queries() {
    let server = Arc::new(TestServer::start().await);
    let index = server
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .server
                .list_auth_methods(AuthMethodListRequest {
                    query: server.query().blocking(index, Duration::from_secs(30)),
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.stop();

    let err = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("Shutdown should release blocked queries")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ControlError::Unavailable(_)));
}

#[tokio::test]
async fn test_timed_out_get_never_goes_below_requested_index() {
    let server = TestServer::start().await;
    let okta = server
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;
    let latest = server
        .upsert_method(oidc_method("auth0", "https://auth0.example.com"))
        .await;
    assert!(latest > okta);

    let resp = server
        .server
        .get_auth_method(AuthMethodSpecificRequest {
            name: "okta".to_string(),
            query: server.query().blocking(latest, Duration::from_millis(50)),
        })
        .await
        .unwrap();
    assert_eq!(resp.auth_method.unwrap().modify_index, okta);
    assert_eq!(resp.meta.index, latest);
}
