use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{ControlError, Result};
use crate::fsm::Fsm;
use crate::oidc::{ProviderCache, StateSigner};
use crate::raft::ConsensusLog;
use crate::rpc::interceptors::{
    Authentication, Authorization, AuthoritativeRegion, Forwarding, Metrics,
};
use crate::rpc::{acl, auth_method, oidc, Forwarder, Handler, Pipeline, RpcContext};
use crate::state::{StateSnapshot, WatchSet};
use crate::structs::{
    Acl, AclRoleUpsertRequest, AuthMethodDeleteRequest, AuthMethodListRequest,
    AuthMethodListResponse, AuthMethodSetRequest, AuthMethodSetResponse,
    AuthMethodSpecificRequest, AuthMethodUpsertRequest, GenericResponse, OidcAuthUrlRequest,
    OidcAuthUrlResponse, OidcCallbackRequest, OidcCallbackResponse, QueryMeta, RpcRequest,
    RpcResponse, SingleAuthMethodResponse,
};

/// Everything an endpoint needs, shared by the interceptors.
pub struct ServerState {
    pub config: ServerConfig,
    pub fsm: Arc<Fsm>,
    pub raft: Arc<dyn ConsensusLog>,
    pub forwarder: Arc<dyn Forwarder>,
    pub providers: ProviderCache,
    pub state_signer: StateSigner,
    pub shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        fsm: Arc<Fsm>,
        raft: Arc<dyn ConsensusLog>,
        forwarder: Arc<dyn Forwarder>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            providers: ProviderCache::new(config.oidc.provider_timeout),
            state_signer: StateSigner::new(&config.oidc.state_key),
            config,
            fsm,
            raft,
            forwarder,
            shutdown,
        }
    }

    /// Point-in-time view of the current state store.
    pub fn snapshot(&self) -> StateSnapshot {
        self.fsm.state().snapshot()
    }

    /// Drop cached providers of auth methods that no longer exist.
    pub fn forget_providers(&self, names: &[String]) {
        for name in names {
            self.providers.invalidate(name);
        }
    }

    pub fn query_meta(&self, index: u64) -> QueryMeta {
        QueryMeta {
            index,
            last_contact: self.raft.last_contact(),
            known_leader: self.raft.leader().is_some(),
        }
    }

    /// Resolve a secret into the ACL it grants. An empty secret is the
    /// anonymous token; with ACLs disabled everything is management.
    pub fn resolve_token(&self, secret: &str) -> Result<Acl> {
        if !self.config.acl_enabled {
            return Ok(Acl::management());
        }
        if secret.is_empty() {
            return Ok(Acl::anonymous());
        }
        let token = self
            .snapshot()
            .acl_token_by_secret_id(&mut WatchSet::new(), secret)
            .ok_or(ControlError::TokenNotFound)?;
        if token.is_expired(Utc::now()) {
            return Err(ControlError::PermissionDenied("ACL token expired".to_string()));
        }
        Ok(Acl::for_token(&token))
    }
}

/// Dispatches each request to its endpoint.
struct Endpoints {
    state: Arc<ServerState>,
}

#[async_trait]
impl Handler for Endpoints {
    async fn handle(&self, _ctx: &RpcContext, request: RpcRequest) -> Result<RpcResponse> {
        let state = &self.state;
        match request {
            RpcRequest::UpsertAuthMethods(req) => {
                auth_method::upsert(state, req).await.map(RpcResponse::Generic)
            }
            RpcRequest::DeleteAuthMethods(req) => {
                auth_method::delete(state, req).await.map(RpcResponse::Generic)
            }
            RpcRequest::ListAuthMethods(req) => auth_method::list(state, req)
                .await
                .map(RpcResponse::AuthMethodList),
            RpcRequest::GetAuthMethod(req) => auth_method::get(state, req)
                .await
                .map(RpcResponse::SingleAuthMethod),
            RpcRequest::GetAuthMethods(req) => auth_method::get_many(state, req)
                .await
                .map(RpcResponse::AuthMethodSet),
            RpcRequest::OidcAuthUrl(req) => {
                oidc::auth_url(state, req).await.map(RpcResponse::OidcAuthUrl)
            }
            RpcRequest::OidcCallback(req) => {
                oidc::callback(state, req).await.map(RpcResponse::OidcCallback)
            }
            RpcRequest::UpsertAclRoles(req) => {
                acl::upsert_roles(state, req).await.map(RpcResponse::Generic)
            }
        }
    }
}

fn unexpected(method: &str, response: &RpcResponse) -> ControlError {
    ControlError::Internal(format!("unexpected response to {}: {:?}", method, response))
}

/// The RPC server: state plus the interceptor pipeline every call takes.
pub struct Server {
    state: Arc<ServerState>,
    pipeline: Pipeline,
}

impl Server {
    pub fn new(state: Arc<ServerState>) -> Self {
        let config = &state.config;
        let pipeline = Pipeline::new(Arc::new(Endpoints {
            state: state.clone(),
        }))
        .with(Arc::new(Metrics))
        .with(Arc::new(AuthoritativeRegion::new(
            config.region.clone(),
            config.authoritative_region.clone(),
        )))
        .with(Arc::new(Forwarding::new(state.clone())))
        .with(Arc::new(Authentication::new(state.clone())))
        .with(Arc::new(Authorization::new(config.acl_enabled)));

        Self { state, pipeline }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Handle a request from a client.
    pub async fn rpc(&self, request: RpcRequest) -> Result<RpcResponse> {
        self.pipeline.call(RpcContext::default(), request).await
    }

    /// Handle a request another server forwarded here.
    pub async fn rpc_forwarded(&self, request: RpcRequest) -> Result<RpcResponse> {
        self.pipeline.call(RpcContext::forwarded(), request).await
    }

    pub async fn upsert_auth_methods(&self, req: AuthMethodUpsertRequest) -> Result<GenericResponse> {
        match self.rpc(RpcRequest::UpsertAuthMethods(req)).await? {
            RpcResponse::Generic(resp) => Ok(resp),
            other => Err(unexpected("AuthMethod.UpsertAuthMethods", &other)),
        }
    }

    pub async fn delete_auth_methods(&self, req: AuthMethodDeleteRequest) -> Result<GenericResponse> {
        match self.rpc(RpcRequest::DeleteAuthMethods(req)).await? {
            RpcResponse::Generic(resp) => Ok(resp),
            other => Err(unexpected("AuthMethod.DeleteAuthMethods", &other)),
        }
    }

    pub async fn list_auth_methods(&self, req: AuthMethodListRequest) -> Result<AuthMethodListResponse> {
        match self.rpc(RpcRequest::ListAuthMethods(req)).await? {
            RpcResponse::AuthMethodList(resp) => Ok(resp),
            other => Err(unexpected("AuthMethod.ListAuthMethods", &other)),
        }
    }

    pub async fn get_auth_method(
        &self,
        req: AuthMethodSpecificRequest,
    ) -> Result<SingleAuthMethodResponse> {
        match self.rpc(RpcRequest::GetAuthMethod(req)).await? {
            RpcResponse::SingleAuthMethod(resp) => Ok(resp),
            other => Err(unexpected("AuthMethod.GetAuthMethod", &other)),
        }
    }

    pub async fn get_auth_methods(&self, req: AuthMethodSetRequest) -> Result<AuthMethodSetResponse> {
        match self.rpc(RpcRequest::GetAuthMethods(req)).await? {
            RpcResponse::AuthMethodSet(resp) => Ok(resp),
            other => Err(unexpected("AuthMethod.GetAuthMethods", &other)),
        }
    }

    pub async fn oidc_auth_url(&self, req: OidcAuthUrlRequest) -> Result<OidcAuthUrlResponse> {
        match self.rpc(RpcRequest::OidcAuthUrl(req)).await? {
            RpcResponse::OidcAuthUrl(resp) => Ok(resp),
            other => Err(unexpected("OIDC.AuthURLRequest", &other)),
        }
    }

    pub async fn oidc_callback(&self, req: OidcCallbackRequest) -> Result<OidcCallbackResponse> {
        match self.rpc(RpcRequest::OidcCallback(req)).await? {
            RpcResponse::OidcCallback(resp) => Ok(resp),
            other => Err(unexpected("OIDC.AuthCallback", &other)),
        }
    }

    pub async fn upsert_acl_roles(&self, req: AclRoleUpsertRequest) -> Result<GenericResponse> {
        match self.rpc(RpcRequest::UpsertAclRoles(req)).await? {
            RpcResponse::Generic(resp) => Ok(resp),
            other => Err(unexpected("ACL.UpsertRoles", &other)),
        }
    }
}
