//! Error types for store operations

/// Errors from store and transaction operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transaction handle unknown, expired, or already consumed. The
    /// three cases are deliberately indistinguishable to callers.
    #[error("invalid or expired state")]
    InvalidState,

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
