use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ControlError, Result};
use crate::structs::duration::go_duration;

/// The only auth method type currently understood.
pub const AUTH_METHOD_TYPE_OIDC: &str = "oidc";

/// Signing algorithm used when a method does not name any.
pub const DEFAULT_SIGNING_ALG: &str = "RS256";

const MAX_NAME_LENGTH: usize = 128;

const SUPPORTED_SIGNING_ALGS: &[&str] = &[
    "RS256", "RS384", "RS512", "PS256", "PS384", "PS512", "ES256", "ES384", "HS256", "HS384",
    "HS512", "EdDSA",
];

/// Identity-provider parameters for an OIDC auth method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthMethodConfig {
    #[serde(rename = "OIDCDiscoveryURL")]
    pub oidc_discovery_url: String,
    #[serde(rename = "OIDCClientID")]
    pub oidc_client_id: String,
    #[serde(rename = "OIDCClientSecret")]
    pub oidc_client_secret: String,
    #[serde(rename = "OIDCScopes")]
    pub oidc_scopes: Vec<String>,
    pub bound_audiences: Vec<String>,
    #[serde(rename = "AllowedRedirectURIs")]
    pub allowed_redirect_uris: Vec<String>,
    pub discovery_ca_pem: Vec<String>,
    pub signing_algs: Vec<String>,
    /// Claim name to internal attribute. The entry whose value is `role`
    /// selects the claim carrying the role name.
    pub claim_mappings: BTreeMap<String, String>,
    pub list_claim_mappings: BTreeMap<String, String>,
}

impl AuthMethodConfig {
    /// Signing algorithms to accept, defaulting to RS256.
    pub fn effective_signing_algs(&self) -> Vec<String> {
        if self.signing_algs.is_empty() {
            vec![DEFAULT_SIGNING_ALG.to_string()]
        } else {
            self.signing_algs.clone()
        }
    }

    pub fn redirect_uri_allowed(&self, redirect_uri: &str) -> bool {
        self.allowed_redirect_uris.iter().any(|u| u == redirect_uri)
    }
}

/// A named, versioned identity federation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethod {
    pub name: String,
    #[serde(rename = "Type")]
    pub method_type: String,
    #[serde(rename = "MaxTokenTTL", with = "go_duration")]
    pub max_token_ttl: Duration,
    #[serde(default)]
    pub config: AuthMethodConfig,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub hash: Vec<u8>,
}

/// Listing view of an auth method; never carries provider secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethodStub {
    pub name: String,
    #[serde(rename = "Type")]
    pub method_type: String,
    pub hash: Vec<u8>,
    pub create_index: u64,
    pub modify_index: u64,
}

/// The fields covered by the content hash. Indexes and create time are
/// assigned by the server and stay out of it.
#[derive(Serialize)]
struct HashedFields<'a> {
    name: &'a str,
    method_type: &'a str,
    max_token_ttl: Duration,
    config: &'a AuthMethodConfig,
}

impl AuthMethod {
    pub fn new(name: impl Into<String>, max_token_ttl: Duration, config: AuthMethodConfig) -> Self {
        Self {
            name: name.into(),
            method_type: AUTH_METHOD_TYPE_OIDC.to_string(),
            max_token_ttl,
            config,
            create_time: None,
            create_index: 0,
            modify_index: 0,
            hash: Vec::new(),
        }
    }

    /// Check the method is well formed before it is submitted to Raft.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.name.is_empty() || self.name.len() > MAX_NAME_LENGTH {
            problems.push(format!(
                "invalid name {:?}: must be 1-{} characters",
                self.name, MAX_NAME_LENGTH
            ));
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            problems.push(format!(
                "invalid name {:?}: only letters, digits, '-' and '_' allowed",
                self.name
            ));
        }

        if self.method_type != AUTH_METHOD_TYPE_OIDC {
            problems.push(format!("invalid type {:?}", self.method_type));
        }

        if self.max_token_ttl.is_zero() {
            problems.push("max token TTL must be greater than zero".to_string());
        }

        let cfg = &self.config;
        if !(cfg.oidc_discovery_url.starts_with("https://")
            || cfg.oidc_discovery_url.starts_with("http://"))
        {
            problems.push("OIDC discovery URL must be an http(s) URL".to_string());
        }
        if cfg.oidc_client_id.is_empty() {
            problems.push("OIDC client ID is required".to_string());
        }
        for alg in &cfg.signing_algs {
            if !SUPPORTED_SIGNING_ALGS.contains(&alg.as_str()) {
                problems.push(format!("unsupported signing algorithm {:?}", alg));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ControlError::InvalidArgument(problems.join("; ")))
        }
    }

    /// Fill in server-assigned defaults.
    pub fn canonicalize(&mut self) {
        if self.create_time.is_none() {
            self.create_time = Some(Utc::now());
        }
    }

    pub fn compute_hash(&self) -> Vec<u8> {
        let fields = HashedFields {
            name: &self.name,
            method_type: &self.method_type,
            max_token_ttl: self.max_token_ttl,
            config: &self.config,
        };
        // Serializing plain structs, strings and maps into a Vec cannot fail.
        let encoded = bincode::serialize(&fields).unwrap_or_default();
        Sha256::digest(&encoded).to_vec()
    }

    pub fn set_hash(&mut self) -> &[u8] {
        self.hash = self.compute_hash();
        &self.hash
    }

    pub fn stub(&self) -> AuthMethodStub {
        AuthMethodStub {
            name: self.name.clone(),
            method_type: self.method_type.clone(),
            hash: self.hash.clone(),
            create_index: self.create_index,
            modify_index: self.modify_index,
        }
    }
}
