//! HTTP gateway over the RPC server.

pub mod error;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::rpc::forward::{ForwardedReply, ForwardedRpc, INTERNAL_RPC_PATH};
use crate::rpc::Server;
use crate::structs::duration::parse_duration;
use crate::structs::{
    AclRole, AclRoleUpsertRequest, AuthMethod, AuthMethodDeleteRequest, AuthMethodListRequest,
    AuthMethodSpecificRequest, AuthMethodUpsertRequest, OidcAuthUrlRequest, OidcCallbackRequest,
    QueryMeta, QueryOptions, WriteOptions,
};

pub use error::ApiError;

pub const HEADER_TOKEN: &str = "X-Nomad-Token";
pub const HEADER_INDEX: &str = "X-Nomad-Index";
pub const HEADER_KNOWN_LEADER: &str = "X-Nomad-KnownLeader";
pub const HEADER_LAST_CONTACT: &str = "X-Nomad-LastContact";

type HttpResult = std::result::Result<Response, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    region: Option<String>,
    prefix: Option<String>,
    index: Option<u64>,
    wait: Option<String>,
}

/// Body of the auth-URL request; the method comes from the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthUrlBody {
    #[serde(rename = "RedirectURI")]
    redirect_uri: String,
    client_nonce: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct IndexBody {
    index: u64,
}

fn token(headers: &HeaderMap) -> String {
    headers
        .get(HEADER_TOKEN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn query_options(headers: &HeaderMap, params: &QueryParams) -> Result<QueryOptions, ApiError> {
    let mut opts = QueryOptions::new(params.region.clone().unwrap_or_default(), token(headers));
    opts.prefix = params.prefix.clone().unwrap_or_default();
    opts.min_query_index = params.index.unwrap_or(0);
    if let Some(wait) = &params.wait {
        opts.max_query_time = parse_duration(wait)
            .map_err(|e| ApiError::bad_request(format!("invalid wait {:?}: {}", wait, e)))?;
    }
    Ok(opts)
}

fn write_options(headers: &HeaderMap, params: &QueryParams) -> WriteOptions {
    WriteOptions::new(params.region.clone().unwrap_or_default(), token(headers))
}

fn meta_headers(meta: &QueryMeta) -> [(&'static str, String); 3] {
    [
        (HEADER_INDEX, meta.index.to_string()),
        (HEADER_KNOWN_LEADER, meta.known_leader.to_string()),
        (HEADER_LAST_CONTACT, meta.last_contact.as_millis().to_string()),
    ]
}

fn index_headers(index: u64) -> [(&'static str, String); 1] {
    [(HEADER_INDEX, index.to_string())]
}

pub fn router(server: Arc<Server>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/auth_methods", get(list_auth_methods))
        .route(
            "/v1/auth_method/:name",
            get(get_auth_method)
                .put(upsert_auth_method)
                .post(upsert_auth_method)
                .delete(delete_auth_method),
        )
        .route("/v1/oidc/auth-url/:name", post(oidc_auth_url).put(oidc_auth_url))
        .route("/v1/oidc/callback", post(oidc_callback).put(oidc_callback))
        .route("/v1/acl/roles", put(upsert_acl_roles))
        .route(INTERNAL_RPC_PATH, post(internal_rpc))
        .layer(cors)
        .with_state(server)
}

/// Serve on an already bound listener until `shutdown` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    server: Arc<Server>,
    shutdown: CancellationToken,
) {
    let app = router(server);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "HTTP server failed");
    }
}

pub async fn run_http(addr: SocketAddr, server: Arc<Server>, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    serve(listener, server, shutdown).await;
}

async fn list_auth_methods(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
) -> HttpResult {
    let query = query_options(&headers, &params)?;
    let resp = server
        .list_auth_methods(AuthMethodListRequest { query })
        .await?;
    Ok((meta_headers(&resp.meta), Json(resp.auth_methods)).into_response())
}

async fn get_auth_method(
    State(server): State<Arc<Server>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
) -> HttpResult {
    let query = query_options(&headers, &params)?;
    let resp = server
        .get_auth_method(AuthMethodSpecificRequest { name, query })
        .await?;
    let headers = meta_headers(&resp.meta);
    match resp.auth_method {
        Some(method) => Ok((headers, Json(method)).into_response()),
        None => {
            let err = ApiError::not_found("auth method not found");
            Ok((err.status, headers, Json(err.body())).into_response())
        }
    }
}

async fn upsert_auth_method(
    State(server): State<Arc<Server>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
    Json(mut method): Json<AuthMethod>,
) -> HttpResult {
    if method.name.is_empty() {
        method.name = name.clone();
    }
    if method.name != name {
        return Err(ApiError::bad_request(format!(
            "auth method name {:?} does not match path {:?}",
            method.name, name
        )));
    }
    let resp = server
        .upsert_auth_methods(AuthMethodUpsertRequest {
            auth_methods: vec![method],
            write: write_options(&headers, &params),
        })
        .await?;
    Ok((index_headers(resp.index), Json(IndexBody { index: resp.index })).into_response())
}

async fn delete_auth_method(
    State(server): State<Arc<Server>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
) -> HttpResult {
    let resp = server
        .delete_auth_methods(AuthMethodDeleteRequest {
            names: vec![name],
            write: write_options(&headers, &params),
        })
        .await?;
    Ok((index_headers(resp.index), Json(IndexBody { index: resp.index })).into_response())
}

async fn oidc_auth_url(
    State(server): State<Arc<Server>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
    Json(body): Json<AuthUrlBody>,
) -> HttpResult {
    let resp = server
        .oidc_auth_url(OidcAuthUrlRequest {
            auth_method: name,
            redirect_uri: body.redirect_uri,
            client_nonce: body.client_nonce,
            write: write_options(&headers, &params),
        })
        .await?;
    Ok(Json(resp).into_response())
}

async fn oidc_callback(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
    Json(mut req): Json<OidcCallbackRequest>,
) -> HttpResult {
    req.write = write_options(&headers, &params);
    let resp = server.oidc_callback(req).await?;
    Ok(Json(resp).into_response())
}

async fn upsert_acl_roles(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
    Json(roles): Json<Vec<AclRole>>,
) -> HttpResult {
    let resp = server
        .upsert_acl_roles(AclRoleUpsertRequest {
            roles,
            write: write_options(&headers, &params),
        })
        .await?;
    Ok((index_headers(resp.index), Json(IndexBody { index: resp.index })).into_response())
}

/// Server-to-server entry point. Errors travel in the body so the caller
/// gets the remote error unchanged.
async fn internal_rpc(
    State(server): State<Arc<Server>>,
    Json(envelope): Json<ForwardedRpc>,
) -> (StatusCode, Json<ForwardedReply>) {
    let reply = server.rpc_forwarded(envelope.request).await;
    (StatusCode::OK, Json(reply))
}
