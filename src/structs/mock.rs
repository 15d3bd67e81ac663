//! Fixtures shared by unit tests.

use std::time::Duration;

use crate::structs::{AclRole, AclToken, AuthMethod, AuthMethodConfig, TokenType};

pub fn auth_method(name: &str) -> AuthMethod {
    AuthMethod::new(
        name,
        Duration::from_secs(3600),
        AuthMethodConfig {
            oidc_discovery_url: "https://idp.example.com".to_string(),
            oidc_client_id: "client-id".to_string(),
            oidc_client_secret: "big-secret".to_string(),
            allowed_redirect_uris: vec!["http://127.0.0.1:4649/oidc/callback".to_string()],
            ..Default::default()
        },
    )
}

pub fn management_token() -> AclToken {
    let mut token = AclToken::generate("Bootstrap Token", TokenType::Management, true);
    token.set_hash();
    token
}

pub fn client_token(role: &AclRole) -> AclToken {
    let mut token = AclToken::generate("client", TokenType::Client, true);
    token.roles.push(crate::structs::AclTokenRoleLink {
        id: role.id.clone(),
        name: role.name.clone(),
    });
    token.set_hash();
    token
}

pub fn role(name: &str) -> AclRole {
    let mut role = AclRole::new(name, vec!["read-only".to_string()]);
    role.set_hash();
    role
}
