use serde_json::{Map, Value};

use crate::error::{ControlError, Result};
use crate::structs::AuthMethodConfig;

/// Claim read for the role name when no claim mapping selects one.
pub const DEFAULT_ROLE_CLAIM: &str = "http://nomad.internal/role";

/// Attribute name a claim mapping uses to select the role claim.
const ROLE_ATTRIBUTE: &str = "role";

pub type Claims = Map<String, Value>;

/// Merge user-info claims over ID-token claims; user info wins.
pub fn merge(mut id_claims: Claims, user_claims: Claims) -> Claims {
    id_claims.extend(user_claims);
    id_claims
}

/// Issuer and subject. A conformant provider always sets both.
pub fn issuer_and_subject(claims: &Claims) -> Result<(String, String)> {
    let iss = string_claim(claims, "iss").unwrap_or_default();
    let sub = string_claim(claims, "sub").unwrap_or_default();
    if iss.is_empty() || sub.is_empty() {
        return Err(ControlError::Internal(
            "OIDC provider returned empty issuer or subject".to_string(),
        ));
    }
    Ok((iss, sub))
}

fn string_claim(claims: &Claims, name: &str) -> Option<String> {
    claims.get(name).and_then(Value::as_str).map(str::to_string)
}

/// Name of the claim that carries the role.
pub fn role_claim(config: &AuthMethodConfig) -> &str {
    config
        .claim_mappings
        .iter()
        .find(|(_, attribute)| attribute.as_str() == ROLE_ATTRIBUTE)
        .map(|(claim, _)| claim.as_str())
        .unwrap_or(DEFAULT_ROLE_CLAIM)
}

/// Look a claim up by name, or by JSON pointer when it starts with `/`.
pub fn lookup<'a>(claims: &'a Claims, selector: &str) -> Option<&'a Value> {
    if selector.starts_with('/') {
        let mut parts = selector[1..].splitn(2, '/');
        let head = parts.next()?.replace("~1", "/").replace("~0", "~");
        let value = claims.get(&head)?;
        match parts.next() {
            Some(rest) => value.pointer(&format!("/{}", rest)),
            None => Some(value),
        }
    } else {
        claims.get(selector)
    }
}

/// The single role these claims map to. A list-valued claim binds its
/// first entry.
pub fn role_name(claims: &Claims, config: &AuthMethodConfig) -> Result<String> {
    let selector = role_claim(config);
    let value = lookup(claims, selector).ok_or_else(|| {
        ControlError::RoleNotFound(format!("no {:?} claim in provider token", selector))
    })?;
    let role = match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(Value::as_str).map(str::to_string),
        _ => None,
    };
    match role {
        Some(role) if !role.is_empty() => Ok(role),
        _ => Err(ControlError::ClaimDecode(format!(
            "claim {:?} is not a role name",
            selector
        ))),
    }
}
