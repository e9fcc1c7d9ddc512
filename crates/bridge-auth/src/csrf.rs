//! CSRF token for the consent form
//!
//! A per-render token embedded as a hidden form field and mirrored in a
//! short-lived cookie (double-submit). The consent POST must present both
//! and they must match; any mismatch is a hard 400, never a silent
//! fallback to an unprotected submission.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use subtle::ConstantTimeEq;

/// Issue a fresh CSRF token: 32 random bytes as URL-safe base64.
pub fn issue() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time comparison of the submitted token against the expected one.
///
/// Length differences short-circuit, which is fine: token length is public.
pub fn validate(submitted: &str, expected: &str) -> bool {
    if submitted.is_empty() || expected.is_empty() {
        return false;
    }
    submitted.as_bytes().ct_eq(expected.as_bytes()).into()
}
