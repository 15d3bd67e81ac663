//! HTTP client for the gateway, used by the CLI.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, Result};
use crate::http::{HEADER_INDEX, HEADER_TOKEN};
use crate::oidc::{CallbackOutcome, CallbackServer};
use crate::structs::{
    AclRole, AuthMethod, AuthMethodStub, OidcAuthUrlResponse, OidcCallbackRequest,
    OidcCallbackResponse, WriteOptions,
};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IndexBody {
    index: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AuthUrlBody<'a> {
    #[serde(rename = "RedirectURI")]
    redirect_uri: &'a str,
    client_nonce: &'a str,
}

/// Rebuild the server's error from an error body's code and message.
fn error_from_code(code: &str, message: String) -> ControlError {
    match code {
        "permission_denied" => ControlError::PermissionDenied(message),
        "acl_token_not_found" => ControlError::TokenNotFound,
        "acl_disabled" => ControlError::AclDisabled,
        "not_found" => ControlError::NotFound(message),
        "acl_role_not_found" => ControlError::RoleNotFound(message),
        "invalid_argument" => ControlError::InvalidArgument(message),
        "unavailable" => ControlError::Unavailable(message),
        "external_provider" => ControlError::ExternalProvider(message),
        "claim_decode" => ControlError::ClaimDecode(message),
        "consensus_apply" => ControlError::ConsensusApply(message),
        _ => ControlError::Internal(message),
    }
}

fn transport(err: reqwest::Error) -> ControlError {
    ControlError::Unavailable(format!("request failed: {}", err))
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    token: Option<String>,
    region: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ControlError::InvalidArgument(format!(
                "address must start with http:// or https://, got: {}",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(transport)?;
        Ok(Self {
            base_url,
            http,
            token: None,
            region: None,
        })
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    fn url(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{}/v1/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn prepare(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = match &self.token {
            Some(token) => builder.header(HEADER_TOKEN, token),
            None => builder,
        };
        match &self.region {
            Some(region) => builder.query(&[("region", region)]),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(error_from_code(&body.error.code, body.error.message)),
            Err(_) => Err(ControlError::Internal(format!("unexpected status {}", status))),
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ControlError::Codec(e.to_string()))
    }

    fn index_of(response: &Response) -> u64 {
        response
            .headers()
            .get(HEADER_INDEX)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Auth-method stubs and the index they were read at.
    pub async fn list_auth_methods(&self, prefix: Option<&str>) -> Result<(Vec<AuthMethodStub>, u64)> {
        let mut request = self.prepare(self.http.get(self.url("auth_methods")));
        if let Some(prefix) = prefix {
            request = request.query(&[("prefix", prefix)]);
        }
        let response = Self::check(request.send().await.map_err(transport)?).await?;
        let index = Self::index_of(&response);
        let stubs = response
            .json()
            .await
            .map_err(|e| ControlError::Codec(e.to_string()))?;
        Ok((stubs, index))
    }

    pub async fn get_auth_method(&self, name: &str) -> Result<Option<AuthMethod>> {
        let request = self.prepare(self.http.get(self.url(&format!("auth_method/{}", name))));
        let response = request.send().await.map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    pub async fn upsert_auth_method(&self, method: &AuthMethod) -> Result<u64> {
        let request = self
            .prepare(self.http.put(self.url(&format!("auth_method/{}", method.name))))
            .json(method);
        let body: IndexBody = Self::decode(request.send().await.map_err(transport)?).await?;
        Ok(body.index)
    }

    pub async fn delete_auth_method(&self, name: &str) -> Result<u64> {
        let request = self.prepare(self.http.delete(self.url(&format!("auth_method/{}", name))));
        let body: IndexBody = Self::decode(request.send().await.map_err(transport)?).await?;
        Ok(body.index)
    }

    pub async fn upsert_acl_roles(&self, roles: &[AclRole]) -> Result<u64> {
        let request = self.prepare(self.http.put(self.url("acl/roles"))).json(roles);
        let body: IndexBody = Self::decode(request.send().await.map_err(transport)?).await?;
        Ok(body.index)
    }

    pub async fn oidc_auth_url(&self, method: &str, redirect_uri: &str, nonce: &str) -> Result<String> {
        let request = self
            .prepare(self.http.post(self.url(&format!("oidc/auth-url/{}", method))))
            .json(&AuthUrlBody {
                redirect_uri,
                client_nonce: nonce,
            });
        let body: OidcAuthUrlResponse = Self::decode(request.send().await.map_err(transport)?).await?;
        Ok(body.url)
    }

    pub async fn oidc_callback(&self, req: &OidcCallbackRequest) -> Result<String> {
        let request = self.prepare(self.http.post(self.url("oidc/callback"))).json(req);
        let body: OidcCallbackResponse =
            Self::decode(request.send().await.map_err(transport)?).await?;
        Ok(body.token)
    }

    /// Browser login: listen on `callback_addr`, hand the auth URL to
    /// `open`, wait for the redirect and trade it for a token secret.
    pub async fn login(
        &self,
        method: &str,
        callback_addr: SocketAddr,
        timeout: Duration,
        cancel: &CancellationToken,
        open: impl FnOnce(&str),
    ) -> Result<String> {
        let listener = CallbackServer::start(callback_addr).await?;
        let redirect_uri = listener.redirect_uri();
        let nonce = listener.nonce().to_string();

        let url = self.oidc_auth_url(method, &redirect_uri, &nonce).await?;
        open(&url);

        match listener.wait(timeout, cancel).await {
            CallbackOutcome::Success { code, state } => {
                self.oidc_callback(&OidcCallbackRequest {
                    auth_method: method.to_string(),
                    redirect_uri,
                    client_nonce: nonce,
                    code,
                    state,
                    write: WriteOptions::default(),
                })
                .await
            }
            CallbackOutcome::ProviderError { error, description } => Err(
                ControlError::ExternalProvider(format!("{}: {}", error, description)),
            ),
            CallbackOutcome::TimedOut => Err(ControlError::Unavailable(
                "timed out waiting for the login redirect".to_string(),
            )),
            CallbackOutcome::Cancelled => {
                Err(ControlError::Unavailable("login cancelled".to_string()))
            }
        }
    }
}
