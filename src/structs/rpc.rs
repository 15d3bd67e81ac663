use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::structs::acl::AclRole;
use crate::structs::auth_method::{AuthMethod, AuthMethodStub};
use crate::structs::duration::go_duration;

/// Read envelope. `min_query_index == 0` disables blocking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QueryOptions {
    pub region: String,
    pub auth_token: String,
    pub min_query_index: u64,
    #[serde(with = "go_duration")]
    pub max_query_time: Duration,
    pub prefix: String,
}

impl QueryOptions {
    pub fn new(region: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            auth_token: auth_token.into(),
            ..Default::default()
        }
    }

    pub fn blocking(mut self, min_query_index: u64, max_query_time: Duration) -> Self {
        self.min_query_index = min_query_index;
        self.max_query_time = max_query_time;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Write envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WriteOptions {
    pub region: String,
    pub auth_token: String,
}

impl WriteOptions {
    pub fn new(region: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            auth_token: auth_token.into(),
        }
    }
}

/// Consistency metadata attached to every read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QueryMeta {
    pub index: u64,
    #[serde(with = "go_duration")]
    pub last_contact: Duration,
    pub known_leader: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GenericResponse {
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethodUpsertRequest {
    pub auth_methods: Vec<AuthMethod>,
    pub write: WriteOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethodDeleteRequest {
    pub names: Vec<String>,
    pub write: WriteOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethodListRequest {
    pub query: QueryOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethodSpecificRequest {
    pub name: String,
    pub query: QueryOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethodSetRequest {
    pub names: Vec<String>,
    pub query: QueryOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethodListResponse {
    pub auth_methods: Vec<AuthMethodStub>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SingleAuthMethodResponse {
    pub auth_method: Option<AuthMethod>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthMethodSetResponse {
    pub auth_methods: BTreeMap<String, AuthMethod>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OidcAuthUrlRequest {
    pub auth_method: String,
    #[serde(rename = "RedirectURI")]
    pub redirect_uri: String,
    pub client_nonce: String,
    #[serde(default)]
    pub write: WriteOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OidcAuthUrlResponse {
    #[serde(rename = "URL")]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OidcCallbackRequest {
    pub auth_method: String,
    #[serde(rename = "RedirectURI")]
    pub redirect_uri: String,
    pub client_nonce: String,
    pub code: String,
    pub state: String,
    #[serde(default)]
    pub write: WriteOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OidcCallbackResponse {
    /// Secret ID of the freshly minted token.
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclRoleUpsertRequest {
    pub roles: Vec<AclRole>,
    pub write: WriteOptions,
}

/// Every RPC the server dispatches, as one typed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    UpsertAuthMethods(AuthMethodUpsertRequest),
    DeleteAuthMethods(AuthMethodDeleteRequest),
    ListAuthMethods(AuthMethodListRequest),
    GetAuthMethod(AuthMethodSpecificRequest),
    GetAuthMethods(AuthMethodSetRequest),
    OidcAuthUrl(OidcAuthUrlRequest),
    OidcCallback(OidcCallbackRequest),
    UpsertAclRoles(AclRoleUpsertRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Generic(GenericResponse),
    AuthMethodList(AuthMethodListResponse),
    SingleAuthMethod(SingleAuthMethodResponse),
    AuthMethodSet(AuthMethodSetResponse),
    OidcAuthUrl(OidcAuthUrlResponse),
    OidcCallback(OidcCallbackResponse),
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::UpsertAuthMethods(_) => "AuthMethod.UpsertAuthMethods",
            RpcRequest::DeleteAuthMethods(_) => "AuthMethod.DeleteAuthMethods",
            RpcRequest::ListAuthMethods(_) => "AuthMethod.ListAuthMethods",
            RpcRequest::GetAuthMethod(_) => "AuthMethod.GetAuthMethod",
            RpcRequest::GetAuthMethods(_) => "AuthMethod.GetAuthMethods",
            RpcRequest::OidcAuthUrl(_) => "OIDC.AuthURLRequest",
            RpcRequest::OidcCallback(_) => "OIDC.AuthCallback",
            RpcRequest::UpsertAclRoles(_) => "ACL.UpsertRoles",
        }
    }

    pub fn region(&self) -> &str {
        match self {
            RpcRequest::UpsertAuthMethods(r) => &r.write.region,
            RpcRequest::DeleteAuthMethods(r) => &r.write.region,
            RpcRequest::ListAuthMethods(r) => &r.query.region,
            RpcRequest::GetAuthMethod(r) => &r.query.region,
            RpcRequest::GetAuthMethods(r) => &r.query.region,
            RpcRequest::OidcAuthUrl(r) => &r.write.region,
            RpcRequest::OidcCallback(r) => &r.write.region,
            RpcRequest::UpsertAclRoles(r) => &r.write.region,
        }
    }

    pub fn set_region(&mut self, region: &str) {
        let slot = match self {
            RpcRequest::UpsertAuthMethods(r) => &mut r.write.region,
            RpcRequest::DeleteAuthMethods(r) => &mut r.write.region,
            RpcRequest::ListAuthMethods(r) => &mut r.query.region,
            RpcRequest::GetAuthMethod(r) => &mut r.query.region,
            RpcRequest::GetAuthMethods(r) => &mut r.query.region,
            RpcRequest::OidcAuthUrl(r) => &mut r.write.region,
            RpcRequest::OidcCallback(r) => &mut r.write.region,
            RpcRequest::UpsertAclRoles(r) => &mut r.write.region,
        };
        *slot = region.to_string();
    }

    pub fn auth_token(&self) -> &str {
        match self {
            RpcRequest::UpsertAuthMethods(r) => &r.write.auth_token,
            RpcRequest::DeleteAuthMethods(r) => &r.write.auth_token,
            RpcRequest::ListAuthMethods(r) => &r.query.auth_token,
            RpcRequest::GetAuthMethod(r) => &r.query.auth_token,
            RpcRequest::GetAuthMethods(r) => &r.query.auth_token,
            RpcRequest::OidcAuthUrl(r) => &r.write.auth_token,
            RpcRequest::OidcCallback(r) => &r.write.auth_token,
            RpcRequest::UpsertAclRoles(r) => &r.write.auth_token,
        }
    }

    /// Read options, for the requests that can block.
    pub fn query_options(&self) -> Option<&QueryOptions> {
        match self {
            RpcRequest::ListAuthMethods(r) => Some(&r.query),
            RpcRequest::GetAuthMethod(r) => Some(&r.query),
            RpcRequest::GetAuthMethods(r) => Some(&r.query),
            _ => None,
        }
    }

    /// Writes must be serviced by the leader of the target region.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            RpcRequest::ListAuthMethods(_)
                | RpcRequest::GetAuthMethod(_)
                | RpcRequest::GetAuthMethods(_)
        )
    }

    /// Requests that always execute in the authoritative region.
    pub fn authoritative_only(&self) -> bool {
        matches!(
            self,
            RpcRequest::UpsertAuthMethods(_)
                | RpcRequest::DeleteAuthMethods(_)
                | RpcRequest::OidcAuthUrl(_)
                | RpcRequest::OidcCallback(_)
                | RpcRequest::UpsertAclRoles(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_request() -> RpcRequest {
        RpcRequest::ListAuthMethods(AuthMethodListRequest {
            query: QueryOptions::new("eu", "secret"),
        })
    }

    #[test]
    fn region_can_be_rewritten() {
        let mut req = list_request();
        assert_eq!(req.region(), "eu");
        req.set_region("global");
        assert_eq!(req.region(), "global");
        assert_eq!(req.auth_token(), "secret");
    }

    #[test]
    fn reads_are_not_writes() {
        assert!(!list_request().is_write());
        assert!(!list_request().authoritative_only());

        let delete = RpcRequest::DeleteAuthMethods(AuthMethodDeleteRequest {
            names: vec!["okta".into()],
            write: WriteOptions::default(),
        });
        assert!(delete.is_write());
        assert!(delete.authoritative_only());
        assert_eq!(delete.method(), "AuthMethod.DeleteAuthMethods");
    }

    #[test]
    fn query_options_serialize_wait_as_duration_string() {
        let opts = QueryOptions::new("global", "").blocking(7, Duration::from_millis(50));
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["MaxQueryTime"], "50ms");
        assert_eq!(json["MinQueryIndex"], 7);
    }
}
