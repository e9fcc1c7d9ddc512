//! Session props: the closed record handed to the downstream issuer
//!
//! `SessionProps` is the opaque bag the downstream issuer stores with its
//! own tokens and hands back on every token-exchange callback. It is a
//! closed, provider-tagged record rather than a free-form map so the
//! refresh bridge can be exhaustive over its fields.
//!
//! All timestamps are absolute unix milliseconds. The token endpoint
//! reports deltas (`expires_in` seconds); callers convert at receipt time
//! via `now_millis()`.

use serde::{Deserialize, Serialize};

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Absolute expiry from a token-endpoint `expires_in` delta. Saturates
/// rather than overflowing on absurd upstream values.
pub fn expires_at_from(now: u64, expires_in_secs: u64) -> u64 {
    now.saturating_add(expires_in_secs.saturating_mul(1000))
}

/// The upstream token material for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Access token expiry as unix millis; None when the upstream did not
    /// declare one (e.g. GitHub access tokens)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<u64>,
}

impl TokenSet {
    /// Remaining access-token lifetime in milliseconds, or None when the
    /// upstream declared no expiry. An already-expired token yields 0.
    pub fn remaining_millis(&self, now: u64) -> Option<u64> {
        self.expires_at.map(|e| e.saturating_sub(now))
    }
}

/// Identity claims normalized across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// The full props bag: provider discriminator + tokens + identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProps {
    pub provider: String,
    pub tokens: TokenSet,
    pub claims: IdentityClaims,
}
