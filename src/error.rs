use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::auth::AuthError;
use crate::providers::ProviderError;
use crate::providers::cost::CostError;
use crate::quota::LedgerError;

/// Unified application error type following OpenAI error format.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Missing or malformed bearer credential.
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    /// A well-formed credential that does not match any key.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Authenticated identity with no quota record.
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    /// The ledger could not be read or written.
    #[error("Quota ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// OpenAI-compatible error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    code: Option<String>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidCredential(_) | Self::Forbidden(_) | Self::QuotaExceeded(_) => {
                StatusCode::FORBIDDEN
            }
            Self::UserNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::UnsupportedConfiguration(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamFailure(_)
            | Self::LedgerUnavailable(_)
            | Self::Database(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Unauthorized(_) | Self::InvalidCredential(_) => "authentication_error",
            Self::Forbidden(_) => "permission_error",
            Self::UserNotFound(_) | Self::NotFound(_) => "not_found_error",
            Self::BadRequest(_) | Self::UnsupportedConfiguration(_) => "invalid_request_error",
            Self::QuotaExceeded(_) => "quota_error",
            Self::UpstreamFailure(_) => "api_error",
            Self::LedgerUnavailable(_) | Self::Database(_) | Self::Internal(_) => "server_error",
        }
    }

    /// Machine-readable code. Both 403 variants of the proxy routes carry one
    /// so clients can tell a bad key from an exhausted quota.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Unauthorized(_) => Some("missing_credential"),
            Self::InvalidCredential(_) => Some("invalid_api_key"),
            Self::UserNotFound(_) => Some("user_not_found"),
            Self::BadRequest(_) => Some("invalid_request"),
            Self::UnsupportedConfiguration(_) => Some("unsupported_configuration"),
            Self::QuotaExceeded(_) => Some("quota_exceeded"),
            Self::UpstreamFailure(_) => Some("upstream_failure"),
            Self::LedgerUnavailable(_) => Some("ledger_unavailable"),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: self.error_code().map(String::from),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {err}"))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(user_id) => Self::UserNotFound(user_id),
            LedgerError::Unavailable(reason) => {
                tracing::error!(error = %reason, "Quota ledger unavailable");
                Self::LedgerUnavailable(reason)
            }
        }
    }
}

impl From<CostError> for AppError {
    fn from(err: CostError) -> Self {
        match err {
            CostError::UnsupportedConfiguration { .. } => {
                Self::UnsupportedConfiguration(err.to_string())
            }
            CostError::InvalidRequest(message) => Self::BadRequest(message),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match &err {
            // Malformed parameters never reach the upstream.
            ProviderError::InvalidRequest(message) => Self::BadRequest(message.clone()),
            ProviderError::NoProvider(_) => Self::Internal(err.to_string()),
            _ => Self::UpstreamFailure(err.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredential => Self::InvalidCredential("Invalid API key".to_string()),
            AuthError::Store(reason) => Self::Internal(format!("Credential store error: {reason}")),
        }
    }
}
