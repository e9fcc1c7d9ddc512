//! Service-specific error types
//!
//! `ApiError` is the request-level error: every handler returns it and
//! `IntoResponse` maps it onto the OAuth error vocabulary. Upstream
//! detail goes to the log, never into the response body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

/// Request-level errors, mapped onto OAuth error codes.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed or unregistered authorization request; rendered to the
    /// user agent, never redirected to an unverified redirect_uri
    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    /// Unknown, expired, or replayed transaction handle
    #[error("invalid or expired state")]
    InvalidState,

    /// Downstream token grant rejected (bad code, bad verifier, dead
    /// upstream refresh token)
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// Downstream client unknown or failed authentication
    #[error("invalid_client")]
    InvalidClient,

    /// Upstream exchange, JWKS, or userinfo failure
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias using service ApiError
pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    fn oauth_code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) | ApiError::InvalidState => "invalid_request",
            ApiError::InvalidGrant(_) => "invalid_grant",
            ApiError::InvalidClient => "invalid_client",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Internal(_) => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::InvalidState | ApiError::InvalidGrant(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::InvalidClient => StatusCode::UNAUTHORIZED,
            // Generic 500 for upstream failures; detail stays in the log
            ApiError::Upstream(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body description. Deliberately generic for state errors (no
    /// unknown/expired/replayed distinction) and upstream/internal
    /// failures (detail stays in the log).
    fn description(&self) -> String {
        match self {
            ApiError::InvalidRequest(msg) => msg.clone(),
            ApiError::InvalidState => "invalid or expired state".into(),
            ApiError::InvalidGrant(msg) => msg.clone(),
            ApiError::InvalidClient => "client authentication failed".into(),
            ApiError::Upstream(_) => "upstream provider error".into(),
            ApiError::Internal(_) => "internal error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Upstream(detail) => error!(detail, "upstream failure"),
            ApiError::Internal(detail) => error!(detail, "internal failure"),
            other => warn!(error = %other, "request rejected"),
        }

        let body = serde_json::json!({
            "error": self.oauth_code(),
            "error_description": self.description(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<bridge_auth::Error> for ApiError {
    fn from(err: bridge_auth::Error) -> Self {
        match err {
            bridge_auth::Error::InvalidGrant(msg) => ApiError::InvalidGrant(msg),
            bridge_auth::Error::Http(msg)
            | bridge_auth::Error::TokenExchange(msg)
            | bridge_auth::Error::Claims(msg) => ApiError::Upstream(msg),
        }
    }
}

impl From<bridge_store::Error> for ApiError {
    fn from(err: bridge_store::Error) -> Self {
        match err {
            bridge_store::Error::InvalidState => ApiError::InvalidState,
            bridge_store::Error::Store(msg) | bridge_store::Error::Serialize(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}
