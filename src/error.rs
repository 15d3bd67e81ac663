use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by every RPC, state-store and provider operation.
///
/// The type is serializable so a forwarded RPC hands the remote handler's
/// error back to the caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("ACL token not found")]
    TokenNotFound,

    #[error("ACL support disabled")]
    AclDisabled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("ACL role not found: {0}")]
    RoleNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("External provider error: {0}")]
    ExternalProvider(String),

    #[error("Failed to decode claims: {0}")]
    ClaimDecode(String),

    #[error("Raft apply failed: {0}")]
    ConsensusApply(String),

    #[error("Unrecognized snapshot record kind: {0}")]
    UnrecognizedRecordKind(u8),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the HTTP gateway and the API client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    NotFound,
    InvalidArgument,
    Unavailable,
    ExternalProvider,
    Internal,
    ConsensusApply,
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::PermissionDenied(_) | ControlError::TokenNotFound => {
                ErrorKind::PermissionDenied
            }
            ControlError::NotFound(_) | ControlError::RoleNotFound(_) => ErrorKind::NotFound,
            ControlError::InvalidArgument(_) | ControlError::AclDisabled => {
                ErrorKind::InvalidArgument
            }
            ControlError::Unavailable(_) => ErrorKind::Unavailable,
            ControlError::ExternalProvider(_) | ControlError::ClaimDecode(_) => {
                ErrorKind::ExternalProvider
            }
            ControlError::ConsensusApply(_) => ErrorKind::ConsensusApply,
            ControlError::UnrecognizedRecordKind(_)
            | ControlError::Codec(_)
            | ControlError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only availability failures are safe to retry blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControlError::Unavailable(_))
    }

    /// Stable machine-readable name, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::PermissionDenied(_) => "permission_denied",
            ControlError::TokenNotFound => "acl_token_not_found",
            ControlError::AclDisabled => "acl_disabled",
            ControlError::NotFound(_) => "not_found",
            ControlError::RoleNotFound(_) => "acl_role_not_found",
            ControlError::InvalidArgument(_) => "invalid_argument",
            ControlError::Unavailable(_) => "unavailable",
            ControlError::ExternalProvider(_) => "external_provider",
            ControlError::ClaimDecode(_) => "claim_decode",
            ControlError::ConsensusApply(_) => "consensus_apply",
            ControlError::UnrecognizedRecordKind(_) => "unrecognized_record_kind",
            ControlError::Codec(_) => "codec",
            ControlError::Internal(_) => "internal",
        }
    }

    pub fn permission_denied() -> Self {
        ControlError::PermissionDenied("Permission denied".to_string())
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Codec(err.to_string())
    }
}

impl From<bincode::Error> for ControlError {
    fn from(err: bincode::Error) -> Self {
        ControlError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::ClaimDecode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
