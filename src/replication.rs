//! Auth-method replication from the authoritative region.
//!
//! The leader of every other region long-polls the authoritative region's
//! auth-method list, diffs the stubs against its own table by hash and
//! applies the difference through its local log.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, Result};
use crate::raft::{wait_for_leadership, Command};
use crate::rpc::ServerState;
use crate::state::WatchSet;
use crate::structs::{
    AuthMethod, AuthMethodListRequest, AuthMethodSetRequest, AuthMethodStub, QueryOptions,
    RpcRequest, RpcResponse,
};

/// Compare local methods with the authoritative stubs. Returns the names to
/// delete locally and the names to fetch and upsert.
pub fn diff_auth_methods(
    local: &[AuthMethod],
    remote: &[AuthMethodStub],
) -> (Vec<String>, Vec<String>) {
    let remote_hashes: HashMap<&str, &[u8]> = remote
        .iter()
        .map(|stub| (stub.name.as_str(), stub.hash.as_slice()))
        .collect();
    let local_hashes: HashMap<&str, &[u8]> = local
        .iter()
        .map(|m| (m.name.as_str(), m.hash.as_slice()))
        .collect();

    let delete = local
        .iter()
        .filter(|m| !remote_hashes.contains_key(m.name.as_str()))
        .map(|m| m.name.clone())
        .collect();

    let update = remote
        .iter()
        .filter(|stub| local_hashes.get(stub.name.as_str()) != Some(&stub.hash.as_slice()))
        .map(|stub| stub.name.clone())
        .collect();

    (delete, update)
}

/// Run replication while this node leads a non-authoritative region.
/// Returns on leadership loss or shutdown.
pub async fn replicate_auth_methods(state: Arc<ServerState>, shutdown: CancellationToken) {
    let cfg = state.config.replication.clone();
    let mut leadership = state.raft.leadership();
    let mut remote_index = 0;
    let mut backoff = cfg.interval;

    tracing::info!(
        region = %state.config.region,
        authoritative = %state.config.authoritative_region,
        "Starting auth method replication"
    );

    loop {
        let round = tokio::select! {
            result = replicate_once(&state, remote_index) => result,
            _ = shutdown.cancelled() => break,
            _ = stepped_down(&mut leadership) => break,
        };

        let pause = match round {
            Ok(index) => {
                remote_index = index;
                backoff = cfg.interval;
                cfg.interval
            }
            Err(e) => {
                tracing::warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Auth method replication failed");
                let pause = backoff;
                backoff = (backoff * 2).min(cfg.max_backoff);
                pause
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.cancelled() => break,
            _ = stepped_down(&mut leadership) => break,
        }
    }

    tracing::info!("Stopped auth method replication");
}

async fn stepped_down(rx: &mut watch::Receiver<bool>) {
    wait_for_leadership(rx, false).await;
}

/// One round: block on the remote list past `remote_index`, then converge.
/// Returns the remote index reached.
pub async fn replicate_once(state: &ServerState, remote_index: u64) -> Result<u64> {
    let authoritative = state.config.authoritative_region.as_str();
    let token = state.config.replication.token.clone().unwrap_or_default();

    let query = QueryOptions::new(authoritative, token.clone())
        .blocking(remote_index, state.config.blocking.default_wait);
    let list = match state
        .forwarder
        .forward_region(authoritative, RpcRequest::ListAuthMethods(AuthMethodListRequest { query }))
        .await?
    {
        RpcResponse::AuthMethodList(resp) => resp,
        other => {
            return Err(ControlError::Internal(format!(
                "unexpected list response: {:?}",
                other
            )))
        }
    };

    let local = state.snapshot().auth_methods(&mut WatchSet::new());
    let (delete, update) = diff_auth_methods(&local, &list.auth_methods);

    if !delete.is_empty() {
        let count = delete.len();
        let index = state.raft.apply(Command::DeleteAuthMethods(delete.clone())).await?;
        state.forget_providers(&delete);
        tracing::info!(index, count, "Removed auth methods deleted upstream");
    }

    if !update.is_empty() {
        let request = AuthMethodSetRequest {
            names: update,
            query: QueryOptions::new(authoritative, token),
        };
        let methods = match state
            .forwarder
            .forward_region(authoritative, RpcRequest::GetAuthMethods(request))
            .await?
        {
            RpcResponse::AuthMethodSet(resp) => resp.auth_methods,
            other => {
                return Err(ControlError::Internal(format!(
                    "unexpected fetch response: {:?}",
                    other
                )))
            }
        };
        if !methods.is_empty() {
            let count = methods.len();
            let methods: Vec<AuthMethod> = methods.into_values().collect();
            let index = state.raft.apply(Command::UpsertAuthMethods(methods)).await?;
            tracing::info!(index, count, "Replicated auth methods");
        }
    }

    Ok(list.meta.index)
}

/// Drive replication across leadership changes: start a replication task
/// each time this node becomes leader, until shutdown.
pub async fn run_replication(state: Arc<ServerState>, shutdown: CancellationToken) {
    if state.config.is_authoritative() {
        return;
    }
    let mut leadership = state.raft.leadership();
    loop {
        tokio::select! {
            alive = wait_for_leadership(&mut leadership, true) => {
                if !alive {
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }
        replicate_auth_methods(state.clone(), shutdown.clone()).await;
        if shutdown.is_cancelled() || !wait_for_leadership(&mut leadership, false).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::mock;

    fn hashed(name: &str) -> AuthMethod {
        let mut m = mock::auth_method(name);
        m.set_hash();
        m
    }

    #[test]
    fn diff_finds_deletes_and_updates() {
        let keep = hashed("keep");
        let stale = hashed("stale");
        let gone = hashed("gone");

        let mut changed = stale.clone();
        changed.config.bound_audiences.push("nomad".into());
        changed.set_hash();
        let added = hashed("added");

        let local = vec![keep.clone(), stale, gone];
        let remote = vec![keep.stub(), changed.stub(), added.stub()];

        let (delete, mut update) = diff_auth_methods(&local, &remote);
        update.sort();
        assert_eq!(delete, vec!["gone".to_string()]);
        assert_eq!(update, vec!["added".to_string(), "stale".to_string()]);
    }

    #[test]
    fn identical_tables_need_nothing() {
        let local = vec![hashed("a"), hashed("b")];
        let remote: Vec<_> = local.iter().map(AuthMethod::stub).collect();
        let (delete, update) = diff_auth_methods(&local, &remote);
        assert!(delete.is_empty());
        assert!(update.is_empty());
    }
}
