use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ControlError, Result};
use crate::oidc::claims::Claims;
use crate::structs::AuthMethod;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

fn provider_error(context: &str, err: impl std::fmt::Display) -> ControlError {
    ControlError::ExternalProvider(format!("{}: {}", context, err))
}

/// Provider settings taken from an auth method.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub signing_algs: Vec<Algorithm>,
    pub bound_audiences: Vec<String>,
    pub allowed_redirect_uris: Vec<String>,
    pub ca_pem: Vec<String>,
}

impl ProviderConfig {
    pub fn from_auth_method(method: &AuthMethod) -> Result<Self> {
        let cfg = &method.config;
        let signing_algs = cfg
            .effective_signing_algs()
            .iter()
            .map(|alg| {
                Algorithm::from_str(alg).map_err(|_| {
                    ControlError::InvalidArgument(format!("unsupported signing algorithm {:?}", alg))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            issuer: cfg.oidc_discovery_url.trim_end_matches('/').to_string(),
            client_id: cfg.oidc_client_id.clone(),
            client_secret: cfg.oidc_client_secret.clone(),
            scopes: cfg.oidc_scopes.clone(),
            signing_algs,
            bound_audiences: cfg.bound_audiences.clone(),
            allowed_redirect_uris: cfg.allowed_redirect_uris.clone(),
            ca_pem: cfg.discovery_ca_pem.clone(),
        })
    }
}

/// The parts of the provider's discovery document in use.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub jwks_uri: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
}

/// One login attempt: what the auth URL was issued with and what the
/// callback must match.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub state: String,
    pub nonce: String,
    pub redirect_uri: String,
    pub expires_at: DateTime<Utc>,
    /// When non-empty the ID token must name at least one of these.
    pub audiences: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
    #[serde(default)]
    access_token: String,
}

/// Result of a successful code exchange.
#[derive(Debug, Clone)]
pub struct ProviderTokens {
    /// Verified ID-token claims.
    pub claims: Claims,
    pub access_token: String,
}

/// A discovered OIDC provider.
#[derive(Debug)]
pub struct Provider {
    config: ProviderConfig,
    discovery: DiscoveryDocument,
    http: reqwest::Client,
}

impl Provider {
    /// Fetch the discovery document. Every later call to the provider uses
    /// `timeout` as its deadline.
    pub async fn discover(config: ProviderConfig, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        for pem in &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| provider_error("invalid discovery CA certificate", e))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| provider_error("failed to build provider client", e))?;

        let url = format!("{}{}", config.issuer, DISCOVERY_PATH);
        let discovery: DiscoveryDocument = http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| provider_error("OIDC discovery failed", e))?
            .json()
            .await
            .map_err(|e| provider_error("invalid OIDC discovery document", e))?;

        if discovery.issuer.trim_end_matches('/') != config.issuer {
            return Err(ControlError::ExternalProvider(format!(
                "issuer {:?} does not match discovery URL {:?}",
                discovery.issuer, config.issuer
            )));
        }

        tracing::debug!(issuer = %discovery.issuer, "Discovered OIDC provider");
        Ok(Self {
            config,
            discovery,
            http,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn discovery(&self) -> &DiscoveryDocument {
        &self.discovery
    }

    /// The URL the user's browser is sent to.
    pub fn auth_url(&self, req: &AuthRequest) -> Result<String> {
        let mut url = url::Url::parse(&self.discovery.authorization_endpoint)
            .map_err(|e| provider_error("invalid authorization endpoint", e))?;

        let mut scopes = vec!["openid".to_string()];
        scopes.extend(self.config.scopes.iter().filter(|s| *s != "openid").cloned());

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &req.redirect_uri)
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", &req.state)
            .append_pair("nonce", &req.nonce);
        Ok(url.into())
    }

    /// Trade an authorization code for tokens and verify the ID token
    /// against `req`.
    pub async fn exchange(&self, req: &AuthRequest, state: &str, code: &str) -> Result<ProviderTokens> {
        if state != req.state {
            return Err(ControlError::ExternalProvider(
                "state does not match the auth request".to_string(),
            ));
        }
        if Utc::now() > req.expires_at {
            return Err(ControlError::ExternalProvider(
                "auth request expired".to_string(),
            ));
        }

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", req.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let tokens: TokenResponse = self
            .http
            .post(&self.discovery.token_endpoint)
            .form(&form)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| provider_error("code exchange failed", e))?
            .json()
            .await
            .map_err(|e| provider_error("invalid token response", e))?;

        let claims = self.verify_id_token(&tokens.id_token, req).await?;
        Ok(ProviderTokens {
            claims,
            access_token: tokens.access_token,
        })
    }

    async fn verify_id_token(&self, id_token: &str, req: &AuthRequest) -> Result<Claims> {
        let header =
            decode_header(id_token).map_err(|e| provider_error("malformed ID token", e))?;
        if !self.config.signing_algs.contains(&header.alg) {
            return Err(ControlError::ExternalProvider(format!(
                "ID token signed with unsupported algorithm {:?}",
                header.alg
            )));
        }

        let key = match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                DecodingKey::from_secret(self.config.client_secret.as_bytes())
            }
            _ => {
                let jwks = self.fetch_jwks().await?;
                let jwk = match header.kid.as_deref() {
                    Some(kid) => jwks.find(kid),
                    None => jwks.keys.first(),
                }
                .ok_or_else(|| {
                    ControlError::ExternalProvider("no matching signing key".to_string())
                })?;
                DecodingKey::from_jwk(jwk)
                    .map_err(|e| provider_error("unusable signing key", e))?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.discovery.issuer.as_str()]);
        validation.set_audience(&[self.config.client_id.as_str()]);

        let claims = decode::<Claims>(id_token, &key, &validation)
            .map_err(|e| provider_error("ID token rejected", e))?
            .claims;

        if claims.get("nonce").and_then(Value::as_str) != Some(req.nonce.as_str()) {
            return Err(ControlError::ExternalProvider(
                "ID token nonce does not match the auth request".to_string(),
            ));
        }

        if !req.audiences.is_empty() {
            let bound = match claims.get("aud") {
                Some(Value::String(aud)) => req.audiences.contains(aud),
                Some(Value::Array(auds)) => auds
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|aud| req.audiences.iter().any(|b| b == aud)),
                _ => false,
            };
            if !bound {
                return Err(ControlError::ExternalProvider(
                    "ID token audience is not bound to this auth method".to_string(),
                ));
            }
        }

        Ok(claims)
    }

    async fn fetch_jwks(&self) -> Result<JwkSet> {
        if self.discovery.jwks_uri.is_empty() {
            return Err(ControlError::ExternalProvider(
                "provider publishes no JWKS".to_string(),
            ));
        }
        self.http
            .get(&self.discovery.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| provider_error("failed to fetch JWKS", e))?
            .json()
            .await
            .map_err(|e| provider_error("invalid JWKS", e))
    }

    /// User-info claims, or none when the provider has no user-info
    /// endpoint. The returned subject must match the ID token's.
    pub async fn user_info(&self, access_token: &str, subject: &str) -> Result<Claims> {
        let endpoint = match &self.discovery.userinfo_endpoint {
            Some(endpoint) if !access_token.is_empty() => endpoint,
            _ => return Ok(Claims::new()),
        };
        let claims: Claims = self
            .http
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| provider_error("user info request failed", e))?
            .json()
            .await
            .map_err(|e| provider_error("invalid user info", e))?;

        if claims.get("sub").and_then(Value::as_str) != Some(subject) {
            return Err(ControlError::ExternalProvider(
                "user info subject does not match ID token".to_string(),
            ));
        }
        Ok(claims)
    }
}
