use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::BlockingQueryConfig;
use crate::error::{ControlError, Result};
use crate::raft::LeaderInfo;
use crate::rpc::blocking::max_query_wait;
use crate::structs::{RpcRequest, RpcResponse};

/// Time allowed on top of the remote handler's own work: the longest
/// blocking wait for reads, nothing for everything else.
pub const FORWARD_TIMEOUT_SLACK: Duration = Duration::from_secs(30);

/// Path of the server-to-server endpoint.
pub const INTERNAL_RPC_PATH: &str = "/v1/internal/rpc";

/// Envelope posted to [`INTERNAL_RPC_PATH`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedRpc {
    pub request: RpcRequest,
}

/// Reply from [`INTERNAL_RPC_PATH`]; carries the remote handler's error as-is.
pub type ForwardedReply = std::result::Result<RpcResponse, ControlError>;

/// Moves a request to the server that can service it.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward_leader(&self, leader: &LeaderInfo, request: RpcRequest) -> Result<RpcResponse>;

    async fn forward_region(&self, region: &str, request: RpcRequest) -> Result<RpcResponse>;
}

/// Forwards over HTTP to a peer's internal RPC endpoint.
///
/// Each request gets its own timeout so a forwarded long poll outlives the
/// remote server's jittered wait.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    http: reqwest::Client,
    region_servers: BTreeMap<String, Vec<String>>,
    blocking: BlockingQueryConfig,
}

impl HttpForwarder {
    pub fn new(
        region_servers: BTreeMap<String, Vec<String>>,
        blocking: BlockingQueryConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ControlError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            region_servers,
            blocking,
        })
    }

    /// Transport timeout for `request`.
    pub fn request_timeout(&self, request: &RpcRequest) -> Duration {
        match request.query_options() {
            Some(query) if query.min_query_index > 0 => {
                max_query_wait(&self.blocking, query.max_query_time) + FORWARD_TIMEOUT_SLACK
            }
            _ => FORWARD_TIMEOUT_SLACK,
        }
    }

    async fn post(&self, base: &str, request: RpcRequest) -> Result<RpcResponse> {
        let url = format!("{}{}", base.trim_end_matches('/'), INTERNAL_RPC_PATH);
        let method = request.method();
        let timeout = self.request_timeout(&request);
        tracing::debug!(url = %url, method, timeout_ms = timeout.as_millis() as u64, "Forwarding RPC");

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&ForwardedRpc { request })
            .send()
            .await
            .map_err(|e| ControlError::Unavailable(format!("failed to reach {}: {}", base, e)))?;

        let reply: ForwardedReply = response
            .json()
            .await
            .map_err(|e| ControlError::Unavailable(format!("bad reply from {}: {}", base, e)))?;
        reply
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward_leader(&self, leader: &LeaderInfo, request: RpcRequest) -> Result<RpcResponse> {
        self.post(&leader.addr, request).await
    }

    async fn forward_region(&self, region: &str, request: RpcRequest) -> Result<RpcResponse> {
        let server = self
            .region_servers
            .get(region)
            .and_then(|servers| servers.choose(&mut rand::thread_rng()))
            .cloned()
            .ok_or_else(|| {
                ControlError::Unavailable(format!("no path to region {:?}", region))
            })?;
        self.post(&server, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{AuthMethodListRequest, AuthMethodUpsertRequest, QueryOptions};

    fn forwarder() -> HttpForwarder {
        HttpForwarder::new(BTreeMap::new(), BlockingQueryConfig::default()).unwrap()
    }

    fn list(query: QueryOptions) -> RpcRequest {
        RpcRequest::ListAuthMethods(AuthMethodListRequest { query })
    }

    #[test]
    fn long_poll_timeout_covers_the_longest_jittered_wait() {
        let forwarder = forwarder();
        let cfg = BlockingQueryConfig::default();

        let request = list(QueryOptions::new("eu", "").blocking(7, cfg.max_wait));
        let timeout = forwarder.request_timeout(&request);
        let worst = cfg.max_wait + cfg.max_wait / cfg.jitter_fraction;
        assert!(timeout > worst);
        for _ in 0..1000 {
            assert!(crate::rpc::blocking::query_wait(&cfg, cfg.max_wait) < timeout);
        }

        // The default wait applies when the caller gives none
        let request = list(QueryOptions::new("eu", "").blocking(7, Duration::ZERO));
        assert_eq!(
            forwarder.request_timeout(&request),
            cfg.default_wait + cfg.default_wait / cfg.jitter_fraction + FORWARD_TIMEOUT_SLACK
        );
    }

    #[test]
    fn non_blocking_requests_use_the_slack_alone() {
        let forwarder = forwarder();
        let read = list(QueryOptions::new("eu", ""));
        assert_eq!(forwarder.request_timeout(&read), FORWARD_TIMEOUT_SLACK);

        let write = RpcRequest::UpsertAuthMethods(AuthMethodUpsertRequest {
            auth_methods: vec![],
            write: Default::default(),
        });
        assert_eq!(forwarder.request_timeout(&write), FORWARD_TIMEOUT_SLACK);
    }

    #[tokio::test]
    async fn unknown_region_is_unavailable() {
        let forwarder = forwarder();
        let err = forwarder
            .forward_region(
                "mars",
                RpcRequest::ListAuthMethods(AuthMethodListRequest {
                    query: QueryOptions::default(),
                }),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn reply_envelope_keeps_error_kind() {
        let reply: ForwardedReply = Err(ControlError::RoleNotFound("ops".into()));
        let json = serde_json::to_string(&reply).unwrap();
        let back: ForwardedReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Err(ControlError::RoleNotFound("ops".into())));
    }
}
