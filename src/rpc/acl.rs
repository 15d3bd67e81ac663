use crate::error::{ControlError, Result};
use crate::raft::Command;
use crate::rpc::ServerState;
use crate::state::WatchSet;
use crate::structs::{AclRoleUpsertRequest, AclToken, GenericResponse, TokenType};

pub async fn upsert_roles(state: &ServerState, req: AclRoleUpsertRequest) -> Result<GenericResponse> {
    if req.roles.is_empty() {
        return Err(ControlError::InvalidArgument(
            "must specify at least one role".to_string(),
        ));
    }

    let mut roles = req.roles;
    for role in &mut roles {
        role.validate()?;
        role.set_hash();
    }

    let count = roles.len();
    let index = state.raft.apply(Command::UpsertAclRoles(roles)).await?;
    tracing::info!(index, count, "Upserted ACL roles");
    Ok(GenericResponse { index })
}

/// Mint the configured bootstrap management token if no token exists yet.
/// Returns the index of the write, or `None` when nothing was minted.
pub async fn bootstrap(state: &ServerState) -> Result<Option<u64>> {
    let secret = match &state.config.bootstrap_token {
        Some(secret) if state.config.acl_enabled => secret.clone(),
        _ => return Ok(None),
    };
    if !state.snapshot().acl_tokens(&mut WatchSet::new()).is_empty() {
        return Ok(None);
    }

    let mut token = AclToken::generate("Bootstrap Token", TokenType::Management, true);
    token.secret_id = secret;
    token.set_hash();
    let accessor_id = token.accessor_id.clone();

    let index = state
        .raft
        .apply(Command::UpsertAclTokens(vec![token]))
        .await?;
    tracing::info!(index, accessor_id = %accessor_id, "Bootstrapped management token");
    Ok(Some(index))
}
