//! The interceptors every RPC passes through, in pipeline order.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::{ControlError, Result};
use crate::rpc::{
    required_permission, requires_acl, Interceptor, Next, Permission, RpcContext, ServerState,
};
use crate::structs::{Acl, RpcRequest, RpcResponse};

/// Logs method, outcome and latency of every call.
pub struct Metrics;

#[async_trait]
impl Interceptor for Metrics {
    async fn intercept(
        &self,
        ctx: &mut RpcContext,
        request: RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse> {
        let method = request.method();
        let start = Instant::now();
        let result = next.run(ctx, request).await;
        tracing::debug!(
            method,
            forwarded = ctx.forwarded,
            ok = result.is_ok(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "RPC handled"
        );
        result
    }
}

/// Fills in the local region and pins authoritative-only requests to the
/// authoritative region, wherever the caller connected.
pub struct AuthoritativeRegion {
    region: String,
    authoritative: String,
}

impl AuthoritativeRegion {
    pub fn new(region: impl Into<String>, authoritative: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            authoritative: authoritative.into(),
        }
    }
}

#[async_trait]
impl Interceptor for AuthoritativeRegion {
    async fn intercept(
        &self,
        ctx: &mut RpcContext,
        mut request: RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse> {
        if request.authoritative_only() && !self.authoritative.is_empty() {
            request.set_region(&self.authoritative);
        } else if request.region().is_empty() {
            request.set_region(&self.region);
        }
        next.run(ctx, request).await
    }
}

/// Sends requests for another region there, and writes to the leader.
pub struct Forwarding {
    state: Arc<ServerState>,
}

impl Forwarding {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Interceptor for Forwarding {
    async fn intercept(
        &self,
        ctx: &mut RpcContext,
        request: RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse> {
        let local = &self.state.config.region;
        if request.region() != local.as_str() {
            if ctx.forwarded {
                return Err(ControlError::Unavailable(format!(
                    "request for region {:?} was forwarded to region {:?}",
                    request.region(),
                    local
                )));
            }
            let region = request.region().to_string();
            tracing::debug!(method = request.method(), region = %region, "Forwarding to region");
            return self.state.forwarder.forward_region(&region, request).await;
        }

        if request.is_write() && !self.state.raft.is_leader() {
            return match self.state.raft.leader() {
                Some(leader) if leader.id != self.state.config.node_id => {
                    tracing::debug!(
                        method = request.method(),
                        leader_id = leader.id,
                        "Forwarding to leader"
                    );
                    self.state.forwarder.forward_leader(&leader, request).await
                }
                _ => Err(ControlError::Unavailable("No cluster leader".to_string())),
            };
        }

        next.run(ctx, request).await
    }
}

/// Resolves the request's token into an [`Acl`].
pub struct Authentication {
    state: Arc<ServerState>,
}

impl Authentication {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Interceptor for Authentication {
    async fn intercept(
        &self,
        ctx: &mut RpcContext,
        request: RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse> {
        let acl = match required_permission(&request) {
            Permission::None => Acl::anonymous(),
            Permission::Resolvable | Permission::Management => {
                self.state.resolve_token(request.auth_token())?
            }
        };
        ctx.acl = Some(acl);
        next.run(ctx, request).await
    }
}

/// Rejects calls the resolved ACL does not cover. Nothing past this point
/// runs for a rejected call.
pub struct Authorization {
    acl_enabled: bool,
}

impl Authorization {
    pub fn new(acl_enabled: bool) -> Self {
        Self { acl_enabled }
    }
}

#[async_trait]
impl Interceptor for Authorization {
    async fn intercept(
        &self,
        ctx: &mut RpcContext,
        request: RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse> {
        if requires_acl(&request) && !self.acl_enabled {
            return Err(ControlError::AclDisabled);
        }
        if required_permission(&request) == Permission::Management {
            let allowed =
                self.acl_enabled && ctx.acl.as_ref().map(Acl::is_management).unwrap_or(false);
            if !allowed {
                tracing::warn!(method = request.method(), "Permission denied");
                return Err(ControlError::permission_denied());
            }
        }
        next.run(ctx, request).await
    }
}
