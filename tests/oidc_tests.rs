//! Integration tests for OIDC login against a mock identity provider.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use nomad_control::error::ControlError;
use nomad_control::structs::{
    AuthMethodDeleteRequest, OidcAuthUrlRequest, OidcCallbackRequest, TokenType,
};
use test_harness::{
    oidc_method, query_param, MockDelays, MockIdentity, MockProvider, TestServer, CLIENT_ID,
    REDIRECT_URI,
};
use tokio::time::Instant;

const NONCE: &str = "client-nonce-0123456789";

async fn setup() -> (TestServer, MockProvider) {
    let provider = MockProvider::start().await;
    let server = TestServer::start().await;
    server.upsert_method(oidc_method("mock", &provider.url)).await;
    server.upsert_role("engineering").await;
    (server, provider)
}

/// Like `setup`, with a short deadline on identity-provider calls
async fn setup_with_deadline(deadline: Duration) -> (TestServer, MockProvider) {
    let provider = MockProvider::start().await;
    let server = TestServer::start_with(move |mut config| {
        config.oidc.provider_timeout = deadline;
        config
    })
    .await;
    server.upsert_method(oidc_method("mock", &provider.url)).await;
    server.upsert_role("engineering").await;
    (server, provider)
}

fn token_count(server: &TestServer) -> usize {
    server
        .server
        .state()
        .snapshot()
        .acl_tokens(&mut Default::default())
        .len()
}

async fn auth_url(server: &TestServer, nonce: &str) -> Result<String, ControlError> {
    server
        .server
        .oidc_auth_url(OidcAuthUrlRequest {
            auth_method: "mock".to_string(),
            redirect_uri: REDIRECT_URI.to_string(),
            client_nonce: nonce.to_string(),
            write: Default::default(),
        })
        .await
        .map(|resp| resp.url)
}

fn callback_request(code: &str, state: &str, nonce: &str) -> OidcCallbackRequest {
    OidcCallbackRequest {
        auth_method: "mock".to_string(),
        redirect_uri: REDIRECT_URI.to_string(),
        client_nonce: nonce.to_string(),
        code: code.to_string(),
        state: state.to_string(),
        write: Default::default(),
    }
}

fn identity(role: serde_json::Value) -> MockIdentity {
    MockIdentity {
        subject: "alice".to_string(),
        nonce: NONCE.to_string(),
        role: Some(role),
    }
}

#[tokio::test]
async fn test_auth_url_points_at_provider() {
    let (server, provider) = setup().await;

    let url = auth_url(&server, NONCE).await.unwrap();
    assert!(url.starts_with(&format!("{}/authorize?", provider.url)));
    assert_eq!(query_param(&url, "client_id").as_deref(), Some(CLIENT_ID));
    assert_eq!(query_param(&url, "redirect_uri").as_deref(), Some(REDIRECT_URI));
    assert_eq!(query_param(&url, "nonce").as_deref(), Some(NONCE));
    assert_eq!(query_param(&url, "response_type").as_deref(), Some("code"));
    assert!(query_param(&url, "state").unwrap().starts_with("st_"));
    assert!(query_param(&url, "scope").unwrap().contains("openid"));
}

#[tokio::test]
async fn test_auth_url_rejects_bad_requests() {
    let (server, _provider) = setup().await;

    let err = auth_url(&server, "").await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidArgument(_)));

    let err = server
        .server
        .oidc_auth_url(OidcAuthUrlRequest {
            auth_method: "mock".to_string(),
            redirect_uri: "http://evil.example.com/callback".to_string(),
            client_nonce: NONCE.to_string(),
            write: Default::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidArgument(_)));

    let err = server
        .server
        .oidc_auth_url(OidcAuthUrlRequest {
            auth_method: "missing".to_string(),
            redirect_uri: REDIRECT_URI.to_string(),
            client_nonce: NONCE.to_string(),
            write: Default::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

#[tokio::test]
async fn test_callback_mints_client_token_for_role() {
    let (server, provider) = setup().await;

    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();
    provider.authorize("code-1", identity(json!("engineering")));

    let secret = server
        .server
        .oidc_callback(callback_request("code-1", &state, NONCE))
        .await
        .unwrap()
        .token;

    let token = server
        .server
        .state()
        .snapshot()
        .acl_token_by_secret_id(&mut Default::default(), &secret)
        .expect("Minted token should be stored");
    assert_eq!(token.token_type, TokenType::Client);
    assert_eq!(token.name, "OIDC-mock");
    assert!(token.global);
    assert_eq!(token.roles.len(), 1);
    assert_eq!(token.roles[0].name, "engineering");
    let ttl = token.expiration_time.unwrap() - token.create_time;
    assert_eq!(ttl, chrono::Duration::hours(1));

    // The new secret authenticates reads
    let acl = server.server.state().resolve_token(&secret).unwrap();
    assert!(!acl.is_management());
    assert_eq!(acl.roles(), &["engineering".to_string()]);
}

#[tokio::test]
async fn test_list_valued_role_claim_binds_first_entry() {
    let (server, provider) = setup().await;

    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();
    provider.authorize("code-1", identity(json!(["engineering", "ops"])));

    let secret = server
        .server
        .oidc_callback(callback_request("code-1", &state, NONCE))
        .await
        .unwrap()
        .token;
    let acl = server.server.state().resolve_token(&secret).unwrap();
    assert_eq!(acl.roles(), &["engineering".to_string()]);
}

#[tokio::test]
async fn test_state_mismatch_never_reaches_provider() {
    let (server, provider) = setup().await;
    let tokens_before = server
        .server
        .state()
        .snapshot()
        .acl_tokens(&mut Default::default())
        .len();

    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();
    provider.authorize("code-1", identity(json!("engineering")));

    // Same state, different nonce
    let err = server
        .server
        .oidc_callback(callback_request("code-1", &state, "another-nonce"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ExternalProvider(_)));

    // Forged state
    let err = server
        .server
        .oidc_callback(callback_request("code-1", "st_9999999999.AAAA", NONCE))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ExternalProvider(_)));

    assert_eq!(provider.exchanges(), 0);
    let tokens_after = server
        .server
        .state()
        .snapshot()
        .acl_tokens(&mut Default::default())
        .len();
    assert_eq!(tokens_before, tokens_after);
}

#[tokio::test]
async fn test_unknown_role_mints_nothing() {
    let (server, provider) = setup().await;
    let tokens_before = server
        .server
        .state()
        .snapshot()
        .acl_tokens(&mut Default::default())
        .len();

    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();
    provider.authorize("code-1", identity(json!("finance")));

    let err = server
        .server
        .oidc_callback(callback_request("code-1", &state, NONCE))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::RoleNotFound(_)));

    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();
    provider.authorize(
        "code-2",
        MockIdentity {
            subject: "bob".to_string(),
            nonce: NONCE.to_string(),
            role: Some(json!(42)),
        },
    );
    let err = server
        .server
        .oidc_callback(callback_request("code-2", &state, NONCE))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ClaimDecode(_)));

    let tokens_after = server
        .server
        .state()
        .snapshot()
        .acl_tokens(&mut Default::default())
        .len();
    assert_eq!(tokens_before, tokens_after);
}

#[tokio::test]
async fn test_provider_rejecting_code_is_external_error() {
    let (server, provider) = setup().await;

    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();

    let err = server
        .server
        .oidc_callback(callback_request("never-issued", &state, NONCE))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ExternalProvider(_)));
    assert_eq!(provider.exchanges(), 1);
}

#[tokio::test]
async fn test_oidc_works_without_a_token() {
    let (server, provider) = setup().await;
    // Empty auth tokens are fine for the login endpoints
    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();
    provider.authorize("code-1", identity(json!("engineering")));
    let resp = server
        .server
        .oidc_callback(callback_request("code-1", &state, NONCE))
        .await;
    assert!(resp.is_ok());
}

#[tokio::test]
async fn test_slow_discovery_hits_the_deadline() {
    let deadline = Duration::from_millis(300);
    let (server, provider) = setup_with_deadline(deadline).await;
    provider.set_delays(MockDelays {
        discovery: Duration::from_secs(3),
        ..Default::default()
    });

    let start = Instant::now();
    let err = auth_url(&server, NONCE).await.unwrap_err();
    assert!(matches!(err, ControlError::ExternalProvider(_)));
    assert!(start.elapsed() < deadline + Duration::from_millis(500));
    assert_eq!(provider.exchanges(), 0);
}

#[tokio::test]
async fn test_slow_token_endpoint_hits_the_deadline() {
    let deadline = Duration::from_millis(300);
    let (server, provider) = setup_with_deadline(deadline).await;
    let tokens_before = token_count(&server);

    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();
    provider.authorize("code-1", identity(json!("engineering")));
    provider.set_delays(MockDelays {
        token: Duration::from_secs(3),
        ..Default::default()
    });

    let start = Instant::now();
    let err = server
        .server
        .oidc_callback(callback_request("code-1", &state, NONCE))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ExternalProvider(_)));
    assert!(start.elapsed() < deadline + Duration::from_millis(500));
    assert_eq!(token_count(&server), tokens_before);
}

#[tokio::test]
async fn test_callback_shares_one_deadline_across_provider_calls() {
    let deadline = Duration::from_millis(600);
    let (server, provider) = setup_with_deadline(deadline).await;
    let tokens_before = token_count(&server);

    let url = auth_url(&server, NONCE).await.unwrap();
    let state = query_param(&url, "state").unwrap();
    provider.authorize("code-1", identity(json!("engineering")));
    // Each call fits the deadline on its own, together they do not
    provider.set_delays(MockDelays {
        token: Duration::from_millis(400),
        userinfo: Duration::from_millis(400),
        ..Default::default()
    });

    let start = Instant::now();
    let err = server
        .server
        .oidc_callback(callback_request("code-1", &state, NONCE))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ExternalProvider(_)));
    assert!(start.elapsed() < Duration::from_millis(780));
    assert_eq!(provider.exchanges(), 1);
    assert_eq!(token_count(&server), tokens_before);
}

#[tokio::test]
async fn test_deleting_method_drops_cached_provider() {
    let (server, _provider) = setup().await;
    let providers = &server.server.state().providers;

    auth_url(&server, NONCE).await.unwrap();
    assert_eq!(providers.len(), 1);

    server
        .server
        .delete_auth_methods(AuthMethodDeleteRequest {
            names: vec!["mock".to_string()],
            write: server.write(),
        })
        .await
        .unwrap();
    assert!(providers.is_empty());
}

/// A free local port for the login callback listener
async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_cli_login_round_trip() {
    let provider = Arc::new(MockProvider::start().await);
    let server = TestServer::start().await;
    let callback_addr = free_addr().await;
    let redirect_uri = format!("http://{}/oidc/callback", callback_addr);

    let mut method = oidc_method("mock", &provider.url);
    method.config.allowed_redirect_uris = vec![redirect_uri];
    server.upsert_method(method).await;
    server.upsert_role("engineering").await;

    let client = nomad_control::api::ApiClient::new(server.url.clone()).unwrap();
    let browser = provider.clone();
    let secret = client
        .login(
            "mock",
            callback_addr,
            Duration::from_secs(5),
            &CancellationToken::new(),
            move |url| {
                // Play the browser: the provider authenticates the user and
                // redirects back with a code.
                let state = query_param(url, "state").unwrap();
                let nonce = query_param(url, "nonce").unwrap();
                let redirect = query_param(url, "redirect_uri").unwrap();
                browser.authorize(
                    "browser-code",
                    MockIdentity {
                        subject: "alice".to_string(),
                        nonce,
                        role: Some(json!("engineering")),
                    },
                );
                tokio::spawn(async move {
                    let target = format!("{}?code=browser-code&state={}", redirect, state);
                    let _ = reqwest::get(target).await;
                });
            },
        )
        .await
        .unwrap();

    let acl = server.server.state().resolve_token(&secret).unwrap();
    assert_eq!(acl.roles(), &["engineering".to_string()]);
}

#[tokio::test]
async fn test_cli_login_times_out() {
    let provider = MockProvider::start().await;
    let server = TestServer::start().await;
    let callback_addr = free_addr().await;

    let mut method = oidc_method("mock", &provider.url);
    method.config.allowed_redirect_uris = vec![format!("http://{}/oidc/callback", callback_addr)];
    server.upsert_method(method).await;

    let client = nomad_control::api::ApiClient::new(server.url.clone()).unwrap();
    let err = client
        .login(
            "mock",
            callback_addr,
            Duration::from_millis(100),
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Unavailable(_)));
}
