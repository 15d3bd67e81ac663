//! The `AuthMethod.*` endpoints. By the time a request gets here the
//! interceptors have routed it and checked its token.

use std::collections::BTreeMap;

use crate::error::{ControlError, Result};
use crate::raft::Command;
use crate::rpc::{blocking_rpc, ServerState};
use crate::state::TABLE_AUTH_METHODS;
use crate::structs::{
    AuthMethod, AuthMethodDeleteRequest, AuthMethodListRequest, AuthMethodListResponse,
    AuthMethodSetRequest, AuthMethodSetResponse, AuthMethodSpecificRequest,
    AuthMethodUpsertRequest, GenericResponse, SingleAuthMethodResponse,
};

pub async fn upsert(state: &ServerState, req: AuthMethodUpsertRequest) -> Result<GenericResponse> {
    if req.auth_methods.is_empty() {
        return Err(ControlError::InvalidArgument(
            "must specify at least one auth method".to_string(),
        ));
    }

    let mut methods = req.auth_methods;
    for method in &mut methods {
        method.validate()?;
        method.canonicalize();
        method.set_hash();
    }

    let count = methods.len();
    let index = state
        .raft
        .apply(Command::UpsertAuthMethods(methods))
        .await?;
    tracing::info!(index, count, "Upserted auth methods");
    Ok(GenericResponse { index })
}

pub async fn delete(state: &ServerState, req: AuthMethodDeleteRequest) -> Result<GenericResponse> {
    if req.names.is_empty() {
        return Err(ControlError::InvalidArgument(
            "must specify at least one auth method".to_string(),
        ));
    }

    let count = req.names.len();
    let index = state
        .raft
        .apply(Command::DeleteAuthMethods(req.names.clone()))
        .await?;
    state.forget_providers(&req.names);
    tracing::info!(index, count, "Deleted auth methods");
    Ok(GenericResponse { index })
}

pub async fn list(state: &ServerState, req: AuthMethodListRequest) -> Result<AuthMethodListResponse> {
    let prefix = req.query.prefix.as_str();
    let (auth_methods, meta) = blocking_rpc(state, &req.query, |ws, snap| {
        let methods = if prefix.is_empty() {
            snap.auth_methods(ws)
        } else {
            snap.auth_methods_by_prefix(ws, prefix)
        };
        let stubs = methods.iter().map(AuthMethod::stub).collect();
        Ok((stubs, snap.index(TABLE_AUTH_METHODS)))
    })
    .await?;

    Ok(AuthMethodListResponse { auth_methods, meta })
}

/// A missing method is not an error: the reply carries `None` and the table
/// index so the caller can block until it appears.
pub async fn get(
    state: &ServerState,
    req: AuthMethodSpecificRequest,
) -> Result<SingleAuthMethodResponse> {
    let name = req.name.as_str();
    let (auth_method, meta) = blocking_rpc(state, &req.query, |ws, snap| {
        let method = snap.auth_method_by_name(ws, name);
        let index = match &method {
            Some(m) => m.modify_index,
            None => snap.index(TABLE_AUTH_METHODS),
        };
        Ok((method, index))
    })
    .await?;

    Ok(SingleAuthMethodResponse { auth_method, meta })
}

/// Full records for a set of names; names that do not exist are left out.
pub async fn get_many(state: &ServerState, req: AuthMethodSetRequest) -> Result<AuthMethodSetResponse> {
    let names = &req.names;
    let (auth_methods, meta) = blocking_rpc(state, &req.query, |ws, snap| {
        let found: BTreeMap<String, AuthMethod> = names
            .iter()
            .filter_map(|name| snap.auth_method_by_name(ws, name))
            .map(|m| (m.name.clone(), m))
            .collect();
        Ok((found, snap.index(TABLE_AUTH_METHODS)))
    })
    .await?;

    Ok(AuthMethodSetResponse { auth_methods, meta })
}
