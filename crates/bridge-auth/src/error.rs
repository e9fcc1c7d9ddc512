//! Error types for bridge protocol operations

/// Errors from upstream protocol operations.
///
/// `Http` is transport-level (connect failure, timeout); `TokenExchange`
/// is a token endpoint that answered but unusably (non-2xx, malformed
/// JSON, missing access_token). The split matters to callers: both map to
/// a generic 500 user-facing response, but `InvalidGrant` during refresh
/// means the upstream session is gone and must fail the downstream grant
/// rather than be retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("upstream rejected grant: {0}")]
    InvalidGrant(String),

    #[error("claims validation failed: {0}")]
    Claims(String),
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
