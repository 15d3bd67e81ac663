//! Integration tests across two regions: forwarding of reads and
//! authoritative-only writes, and auth-method replication.


use std::time::Duration;

use nomad_control::error::ControlError;
use nomad_control::raft::LeaderInfo;
use nomad_control::structs::{
    AuthMethodDeleteRequest, AuthMethodListRequest, AuthMethodUpsertRequest, QueryOptions,
    RpcRequest, WriteOptions,
};
use test_harness::{assert_eventually, oidc_method, TestServer, ROOT_TOKEN};

/// A global (authoritative) server and an "eu" server pointed at it
async fn two_regions() -> (TestServer, TestServer) {
    let global = TestServer::start().await;
    let global_url = global.url.clone();
    let eu = TestServer::start_with(move |mut config| {
        config.replication.token = Some(ROOT_TOKEN.to_string());
        config
            .with_region("eu")
            .with_authoritative_region("global")
            .with_region_server("global", global_url)
    })
    .await;
    (global, eu)
}

fn local_names(server: &TestServer) -> Vec<String> {
    server
        .server
        .state()
        .snapshot()
        .auth_methods(&mut Default::default())
        .into_iter()
        .map(|m| m.name)
        .collect()
}

#[tokio::test]
async fn test_auth_method_writes_go_to_authoritative_region() {
    let (global, eu) = two_regions().await;

    // Written through the eu server without naming a region
    let index = eu
        .server
        .upsert_auth_methods(AuthMethodUpsertRequest {
            auth_methods: vec![oidc_method("okta", "https://idp.example.com")],
            write: WriteOptions::new("", ROOT_TOKEN),
        })
        .await
        .unwrap()
        .index;

    let stored = global
        .server
        .state()
        .snapshot()
        .auth_method_by_name(&mut Default::default(), "okta")
        .expect("Write should land in the authoritative region");
    assert_eq!(stored.modify_index, index);
}

#[tokio::test]
async fn test_reads_can_target_another_region() {
    let (global, eu) = two_regions().await;
    let index = global
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;

    let list = eu
        .server
        .list_auth_methods(AuthMethodListRequest {
            query: QueryOptions::new("global", ROOT_TOKEN),
        })
        .await
        .unwrap();
    assert_eq!(list.meta.index, index);
    assert_eq!(list.auth_methods.len(), 1);
}

#[tokio::test]
async fn test_unknown_region_is_unavailable() {
    let (_global, eu) = two_regions().await;

    let err = eu
        .server
        .list_auth_methods(AuthMethodListRequest {
            query: QueryOptions::new("mars", ROOT_TOKEN),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Unavailable(_)));
}

#[tokio::test]
async fn test_misrouted_forward_is_not_forwarded_again() {
    let (global, _eu) = two_regions().await;

    let err = global
        .server
        .rpc_forwarded(RpcRequest::ListAuthMethods(AuthMethodListRequest {
            query: QueryOptions::new("eu", ROOT_TOKEN),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Unavailable(_)));
}

#[tokio::test]
async fn test_auth_methods_replicate_to_other_regions() {
    let (global, eu) = two_regions().await;

    global
        .upsert_method(oidc_method("okta", "https://idp.example.com"))
        .await;
    global
        .upsert_method(oidc_method("auth0", "https://auth0.example.com"))
        .await;

    assert_eventually(
        || async { local_names(&eu) == vec!["auth0".to_string(), "okta".to_string()] },
        Duration::from_secs(5),
        "Both methods should replicate to eu",
    )
    .await;

    // Replicated copies carry the same content hash
    let hash_of = |server: &TestServer| {
        server
            .server
            .state()
            .snapshot()
            .auth_method_by_name(&mut Default::default(), "okta")
            .unwrap()
            .hash
    };
    assert_eq!(hash_of(&global), hash_of(&eu));

    // Updates and deletes follow
    let mut changed = oidc_method("okta", "https://idp.example.com");
    changed.config.bound_audiences = vec!["nomad".to_string()];
    global.upsert_method(changed).await;
    global
        .server
        .delete_auth_methods(AuthMethodDeleteRequest {
            names: vec!["auth0".to_string()],
            write: global.write(),
        })
        .await
        .unwrap();

    assert_eventually(
        || async {
            let snap = eu.server.state().snapshot();
            let okta = snap.auth_method_by_name(&mut Default::default(), "okta");
            local_names(&eu) == vec!["okta".to_string()]
                && okta.map(|m| m.config.bound_audiences.len()) == Some(1)
        },
        Duration::from_secs(5),
        "Update and delete should replicate to eu",
    )
    .await;
}

#[tokio::test]
async fn test_follower_forwards_writes_to_its_leader() {
    let leader = TestServer::start().await;
    let follower = TestServer::start_with(|mut config| {
        config.node_id = 2;
        config
    })
    .await;
    follower
        .raft
        .step_down(Some(LeaderInfo {
            id: 1,
            addr: leader.url.clone(),
        }))
        .await
        .unwrap();

    let index = follower
        .server
        .upsert_auth_methods(AuthMethodUpsertRequest {
            auth_methods: vec![oidc_method("okta", "https://idp.example.com")],
            write: follower.write(),
        })
        .await
        .unwrap()
        .index;

    let stored = leader
        .server
        .state()
        .snapshot()
        .auth_method_by_name(&mut Default::default(), "okta")
        .expect("Write should be applied by the leader");
    assert_eq!(stored.create_index, index);
    assert_eq!(stored.modify_index, index);
    assert!(local_names(&follower).is_empty());

    // Errors come back unchanged
    let err = follower
        .server
        .delete_auth_methods(AuthMethodDeleteRequest {
            names: vec!["missing".to_string()],
            write: follower.write(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}
