//! The `OIDC.*` login endpoints.
//!
//! `auth_url` hands out a provider URL whose `state` is bound to the method,
//! redirect URI and client nonce. `callback` checks that binding before it
//! talks to the provider, then maps the verified claims to a role and mints
//! a client token for it through the log.

use std::future::Future;

use chrono::Utc;
use tokio::time::Instant;

use crate::error::{ControlError, Result};
use crate::oidc::{claims, AuthRequest};
use crate::raft::Command;
use crate::rpc::{blocking_rpc, ServerState};
use crate::state::{WatchSet, TABLE_AUTH_METHODS};
use crate::structs::{
    AclToken, AclTokenRoleLink, AuthMethod, OidcAuthUrlRequest, OidcAuthUrlResponse,
    OidcCallbackRequest, OidcCallbackResponse, QueryOptions, TokenType,
};

fn chrono_duration(d: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| ControlError::Internal(e.to_string()))
}

/// One deadline shared by every provider call of a single RPC.
fn provider_deadline(state: &ServerState) -> Instant {
    Instant::now() + state.config.oidc.provider_timeout
}

/// Run a provider call until `deadline`. The call is dropped, and its
/// connection with it, when the deadline passes.
async fn with_deadline<T>(deadline: Instant, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout_at(deadline, fut).await.map_err(|_| {
        ControlError::ExternalProvider("identity provider did not respond in time".to_string())
    })?
}

async fn lookup_method(state: &ServerState, name: &str) -> Result<AuthMethod> {
    if name.is_empty() {
        return Err(ControlError::InvalidArgument(
            "missing auth method name".to_string(),
        ));
    }
    let (method, _) = blocking_rpc(state, &QueryOptions::default(), |ws, snap| {
        Ok((snap.auth_method_by_name(ws, name), snap.index(TABLE_AUTH_METHODS)))
    })
    .await?;
    method.ok_or_else(|| ControlError::NotFound(format!("auth method {:?} not found", name)))
}

fn check_request(method: &AuthMethod, redirect_uri: &str, client_nonce: &str) -> Result<()> {
    if client_nonce.is_empty() {
        return Err(ControlError::InvalidArgument(
            "missing client nonce".to_string(),
        ));
    }
    if !method.config.redirect_uri_allowed(redirect_uri) {
        return Err(ControlError::InvalidArgument(format!(
            "redirect URI {:?} is not allowed by auth method {:?}",
            redirect_uri, method.name
        )));
    }
    Ok(())
}

pub async fn auth_url(state: &ServerState, req: OidcAuthUrlRequest) -> Result<OidcAuthUrlResponse> {
    let method = lookup_method(state, &req.auth_method).await?;
    check_request(&method, &req.redirect_uri, &req.client_nonce)?;

    let deadline = provider_deadline(state);
    let provider = with_deadline(deadline, state.providers.get(&method)).await?;

    let expires_at = Utc::now() + chrono_duration(state.config.oidc.request_ttl)?;
    let request = AuthRequest {
        state: state.state_signer.issue(
            &method.name,
            &req.redirect_uri,
            &req.client_nonce,
            expires_at,
        ),
        nonce: req.client_nonce,
        redirect_uri: req.redirect_uri,
        expires_at,
        audiences: method.config.bound_audiences.clone(),
    };

    let url = provider.auth_url(&request)?;
    tracing::debug!(auth_method = %method.name, "Issued OIDC auth URL");
    Ok(OidcAuthUrlResponse { url })
}

pub async fn callback(state: &ServerState, req: OidcCallbackRequest) -> Result<OidcCallbackResponse> {
    let method = lookup_method(state, &req.auth_method).await?;
    check_request(&method, &req.redirect_uri, &req.client_nonce)?;

    // A state minted for other parameters never reaches the provider.
    let expires_at = state.state_signer.verify(
        &req.state,
        &method.name,
        &req.redirect_uri,
        &req.client_nonce,
        Utc::now(),
    )?;

    let deadline = provider_deadline(state);
    let provider = with_deadline(deadline, state.providers.get(&method)).await?;
    let request = AuthRequest {
        state: req.state.clone(),
        nonce: req.client_nonce.clone(),
        redirect_uri: req.redirect_uri.clone(),
        expires_at,
        audiences: method.config.bound_audiences.clone(),
    };
    let tokens = with_deadline(deadline, provider.exchange(&request, &req.state, &req.code)).await?;

    let (issuer, subject) = claims::issuer_and_subject(&tokens.claims)?;
    let user_claims =
        with_deadline(deadline, provider.user_info(&tokens.access_token, &subject)).await?;
    let merged = claims::merge(tokens.claims, user_claims);

    let role_name = claims::role_name(&merged, &method.config)?;
    let role = state
        .snapshot()
        .acl_role_by_name(&mut WatchSet::new(), &role_name)
        .ok_or_else(|| ControlError::RoleNotFound(role_name.clone()))?;

    let mut token = AclToken::generate(format!("OIDC-{}", method.name), TokenType::Client, true);
    token.roles.push(AclTokenRoleLink {
        id: role.id.clone(),
        name: role.name.clone(),
    });
    if !method.max_token_ttl.is_zero() {
        token.expiration_time = Some(token.create_time + chrono_duration(method.max_token_ttl)?);
    }
    token.set_hash();
    let secret = token.secret_id.clone();
    let accessor_id = token.accessor_id.clone();

    let index = state
        .raft
        .apply(Command::UpsertAclTokens(vec![token]))
        .await?;
    tracing::info!(
        index,
        auth_method = %method.name,
        issuer = %issuer,
        role = %role.name,
        accessor_id = %accessor_id,
        "Minted OIDC token"
    );
    Ok(OidcCallbackResponse { token: secret })
}
