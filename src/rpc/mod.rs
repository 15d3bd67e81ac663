//! Server-side RPC handling.
//!
//! Every request runs through a fixed, ordered chain of [`Interceptor`]s built
//! once at startup and ends in the endpoint [`Handler`]:
//!
//! ```text
//! metrics -> authoritative region -> forwarding -> authentication -> authorization -> endpoint
//! ```

pub mod acl;
pub mod auth_method;
pub mod blocking;
pub mod forward;
pub mod interceptors;
pub mod oidc;
pub mod server;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::structs::{Acl, RpcRequest, RpcResponse};

pub use blocking::blocking_rpc;
pub use forward::{Forwarder, HttpForwarder};
pub use server::{Server, ServerState};

/// Per-call state threaded through the interceptor chain.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    /// Set by the authentication interceptor.
    pub acl: Option<Acl>,
    /// The request arrived from another server rather than a client.
    pub forwarded: bool,
}

impl RpcContext {
    pub fn forwarded() -> Self {
        Self {
            acl: None,
            forwarded: true,
        }
    }
}

/// Privilege a request needs once its token is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// No token needed.
    None,
    /// Any token that resolves, including the anonymous token.
    Resolvable,
    Management,
}

/// What each request requires. Login requests are the only ones that work
/// without ACLs enabled and without a token.
pub fn required_permission(request: &RpcRequest) -> Permission {
    match request {
        RpcRequest::UpsertAuthMethods(_)
        | RpcRequest::DeleteAuthMethods(_)
        | RpcRequest::GetAuthMethods(_)
        | RpcRequest::UpsertAclRoles(_) => Permission::Management,
        RpcRequest::ListAuthMethods(_) | RpcRequest::GetAuthMethod(_) => Permission::Resolvable,
        RpcRequest::OidcAuthUrl(_) | RpcRequest::OidcCallback(_) => Permission::None,
    }
}

/// Requests refused with `AclDisabled` when ACLs are off. Auth-method
/// upserts are not among them: with ACLs off no token is management, so
/// they are denied instead.
pub fn requires_acl(request: &RpcRequest) -> bool {
    !matches!(request, RpcRequest::UpsertAuthMethods(_))
        && required_permission(request) != Permission::None
}

/// Terminal request handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &RpcContext, request: RpcRequest) -> Result<RpcResponse>;
}

/// One link of the chain. Implementations either answer the request
/// themselves or pass it on with `next.run`.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: &mut RpcContext,
        request: RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse>;
}

/// The remainder of the chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut RpcContext, request: RpcRequest) -> Result<RpcResponse> {
        match self.chain.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    chain: rest,
                    handler: self.handler,
                };
                first.intercept(ctx, request, next).await
            }
            None => self.handler.handle(ctx, request).await,
        }
    }
}

/// Interceptors plus handler, composed once.
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            interceptors: Vec::new(),
            handler,
        }
    }

    /// Append an interceptor; the first added runs first.
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub async fn call(&self, mut ctx: RpcContext, request: RpcRequest) -> Result<RpcResponse> {
        let next = Next {
            chain: &self.interceptors,
            handler: self.handler.as_ref(),
        };
        next.run(&mut ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;
    use crate::structs::{AuthMethodListRequest, GenericResponse, QueryOptions};
    use parking_lot::Mutex;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, ctx: &RpcContext, _request: RpcRequest) -> Result<RpcResponse> {
            let index = if ctx.forwarded { 1 } else { 0 };
            Ok(RpcResponse::Generic(GenericResponse { index }))
        }
    }

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Interceptor for Record {
        async fn intercept(
            &self,
            ctx: &mut RpcContext,
            request: RpcRequest,
            next: Next<'_>,
        ) -> Result<RpcResponse> {
            self.log.lock().push(self.name);
            next.run(ctx, request).await
        }
    }

    struct Reject;

    #[async_trait]
    impl Interceptor for Reject {
        async fn intercept(
            &self,
            _ctx: &mut RpcContext,
            _request: RpcRequest,
            _next: Next<'_>,
        ) -> Result<RpcResponse> {
            Err(ControlError::PermissionDenied("rejected".to_string()))
        }
    }

    fn list() -> RpcRequest {
        RpcRequest::ListAuthMethods(AuthMethodListRequest {
            query: QueryOptions::default(),
        })
    }

    #[tokio::test]
    async fn interceptors_run_in_order_then_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Arc::new(Echo))
            .with(Arc::new(Record {
                name: "first",
                log: log.clone(),
            }))
            .with(Arc::new(Record {
                name: "second",
                log: log.clone(),
            }));

        let resp = pipeline.call(RpcContext::forwarded(), list()).await.unwrap();
        assert_eq!(resp, RpcResponse::Generic(GenericResponse { index: 1 }));
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn interceptor_can_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Arc::new(Echo))
            .with(Arc::new(Reject))
            .with(Arc::new(Record {
                name: "never",
                log: log.clone(),
            }));

        let err = pipeline.call(RpcContext::default(), list()).await.unwrap_err();
        assert!(matches!(err, ControlError::PermissionDenied(_)));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn login_needs_no_token() {
        let req = RpcRequest::OidcAuthUrl(crate::structs::OidcAuthUrlRequest {
            auth_method: "okta".into(),
            redirect_uri: "http://localhost/cb".into(),
            client_nonce: "n".into(),
            write: Default::default(),
        });
        assert_eq!(required_permission(&req), Permission::None);
        assert!(!requires_acl(&req));
        assert_eq!(required_permission(&list()), Permission::Resolvable);
    }

    #[test]
    fn auth_method_upsert_is_not_gated_on_acl() {
        let req = RpcRequest::UpsertAuthMethods(crate::structs::AuthMethodUpsertRequest {
            auth_methods: vec![],
            write: Default::default(),
        });
        assert_eq!(required_permission(&req), Permission::Management);
        assert!(!requires_acl(&req));
        assert!(requires_acl(&list()));
    }
}
