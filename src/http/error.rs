//! `ControlError` to HTTP status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::{ControlError, ErrorKind};

#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

impl ApiError {
    pub fn new(code: &'static str, message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            code,
            message: message.into(),
            status,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("invalid_argument", message, StatusCode::BAD_REQUEST)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message, StatusCode::NOT_FOUND)
    }

    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "status": self.status.as_u16()
            }
        })
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ExternalProvider => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal | ErrorKind::ConsensusApply => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self {
            code: err.code(),
            status: status_for(err.kind()),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_and_not_found_stay_distinct() {
        let denied = ApiError::from(ControlError::permission_denied());
        let missing = ApiError::from(ControlError::NotFound("okta".into()));
        assert_eq!(denied.status, StatusCode::FORBIDDEN);
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert_ne!(denied.code, missing.code);
    }

    #[test]
    fn provider_failures_are_bad_gateway() {
        let err = ApiError::from(ControlError::ExternalProvider("discovery failed".into()));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.body()["error"]["status"], 502);
    }

    #[test]
    fn unavailable_is_503() {
        let err = ApiError::from(ControlError::Unavailable("No cluster leader".into()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "unavailable");
    }
}
