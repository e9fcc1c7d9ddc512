//! Common error types

use thiserror::Error;

/// Errors shared across the bridge crates.
///
/// `Config` covers every startup-fatal misconfiguration: a missing signing
/// secret, an unresolved `{tenant}` placeholder, a malformed endpoint URL.
/// Per-request protocol failures never use this type — they have their own
/// taxonomies in `bridge-auth` and `bridge-store`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
