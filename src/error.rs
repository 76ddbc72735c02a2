//! Crate-wide error taxonomy and its HTTP rendering.
//!
//! Every fallible operation in the core returns `Result<T, GatewayError>`.
//! Handlers propagate with `?`; only the outermost `IntoResponse` impl here
//! decides what the client sees. Validation failures get a stable
//! machine-readable body; infrastructure failures are logged with full
//! context and returned without internal detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("insufficient scope")]
    InsufficientScope { required: Vec<String> },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad expires: {0}")]
    BadExpires(String),

    #[error("bad scopes: {0}")]
    BadScopes(String),

    #[error("duplicate token name")]
    DuplicateTokenName,

    #[error("bad cursor: {0}")]
    BadCursor(String),

    #[error("bad IP address or CIDR: {0}")]
    BadIpAddress(String),

    #[error("upstream identity provider failure: {0}")]
    ProviderFailure(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Internal(anyhow::anyhow!(err))
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Internal(anyhow::anyhow!(err))
    }
}

/// `detail: {loc, type, msg}` shape used for 422 validation failures.
#[derive(Serialize)]
struct ValidationDetail {
    loc: Vec<String>,
    #[serde(rename = "type")]
    kind: &'static str,
    msg: String,
}

#[derive(Serialize)]
struct ValidationBody {
    detail: Vec<ValidationDetail>,
}

impl GatewayError {
    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::InvalidToken => "invalid_token",
            GatewayError::InsufficientScope { .. } => "insufficient_scope",
            GatewayError::PermissionDenied(_) => "permission_denied",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::BadExpires(_) => "bad_expires",
            GatewayError::BadScopes(_) => "bad_scopes",
            GatewayError::DuplicateTokenName => "duplicate_token_name",
            GatewayError::BadCursor(_) => "bad_cursor",
            GatewayError::BadIpAddress(_) => "bad_ip_address",
            GatewayError::ProviderFailure(_) => "provider_failure",
            GatewayError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidToken => StatusCode::UNAUTHORIZED,
            GatewayError::InsufficientScope { .. } => StatusCode::FORBIDDEN,
            GatewayError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadExpires(_)
            | GatewayError::BadScopes(_)
            | GatewayError::DuplicateTokenName
            | GatewayError::BadCursor(_)
            | GatewayError::BadIpAddress(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::ProviderFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn is_validation(&self) -> bool {
        matches!(self.status(), StatusCode::UNPROCESSABLE_ENTITY)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        if matches!(self, GatewayError::Internal(_) | GatewayError::ProviderFailure(_)) {
            tracing::error!(error = %self, "infrastructure failure");
            let body = json!({ "error": self.error_type(), "error_description": "internal error" });
            return (status, Json(body)).into_response();
        }

        if self.is_validation() {
            let body = ValidationBody {
                detail: vec![ValidationDetail {
                    loc: vec!["body".to_owned()],
                    kind: self.error_type(),
                    msg: self.to_string(),
                }],
            };
            return (status, Json(body)).into_response();
        }

        tracing::warn!(error = %self, "request rejected");
        let body = json!({ "error": self.error_type(), "error_description": self.to_string() });
        (status, Json(body)).into_response()
    }
}
