//! Signed consent cookie (the Consent Gate)
//!
//! A browser-side allow-list of client IDs the user has already approved,
//! so repeat authorizations skip the consent page. The record is a JSON
//! array of client IDs serialized as `signature.base64url(payload)` where
//! the signature is HMAC-SHA256 over the payload under the server secret.
//!
//! This is a convenience cache, not a security boundary on its own: any
//! parse or signature failure degrades to "nothing approved" and the user
//! simply sees the consent page again. The signature check is constant
//! time.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Check whether `client_id` was previously approved by this browser.
///
/// Returns false on a missing cookie, a malformed value, a signature
/// mismatch, or a payload that is not a JSON string array (fail closed).
pub fn is_approved(cookie: Option<&str>, client_id: &str, secret: &Secret<String>) -> bool {
    decode(cookie, secret)
        .map(|approved| approved.iter().any(|c| c == client_id))
        .unwrap_or(false)
}

/// Record an approval, returning the new cookie value.
///
/// Prior approvals are carried over when the existing cookie verifies;
/// an invalid or missing cookie is treated as an empty set rather than an
/// error, so a tampered cookie silently resets to just this approval.
pub fn record_approval(cookie: Option<&str>, client_id: &str, secret: &Secret<String>) -> String {
    let mut approved = decode(cookie, secret).unwrap_or_default();
    if !approved.iter().any(|c| c == client_id) {
        approved.push(client_id.to_string());
    }
    encode(&approved, secret)
}

/// Decode and verify a consent cookie into the approved client-id list.
///
/// None on any failure: missing value, wrong segment count, bad base64,
/// signature mismatch, or non-array JSON.
fn decode(cookie: Option<&str>, secret: &Secret<String>) -> Option<Vec<String>> {
    let value = cookie?;
    let (signature, payload_b64) = value.split_once('.')?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

    // verify_slice is a constant-time comparison
    let mut mac = HmacSha256::new_from_slice(secret.expose_bytes()).ok()?;
    mac.update(&payload);
    mac.verify_slice(&signature).ok()?;

    serde_json::from_slice::<Vec<String>>(&payload).ok()
}

fn encode(approved: &[String], secret: &Secret<String>) -> String {
    // Vec<String> serialization cannot fail
    let payload = serde_json::to_vec(approved).unwrap_or_default();
    let mut mac =
        HmacSha256::new_from_slice(secret.expose_bytes()).expect("HMAC accepts any key length");
    mac.update(&payload);
    let signature = mac.finalize().into_bytes();
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(signature),
        URL_SAFE_NO_PAD.encode(&payload)
    )
}
