//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge used for the upstream
//! authorization flow. The verifier stays server-side inside the
//! transaction and is sent only during token exchange; the challenge goes
//! into the upstream authorize URL so the provider can verify the exchange
//! request came from the party that initiated the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A freshly generated verifier/challenge pair.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

/// Generate a cryptographically random PKCE pair.
///
/// The verifier is 48 random bytes encoded as URL-safe base64 without
/// padding, 64 characters — inside the 43-128 character range RFC 7636
/// requires.
pub fn generate() -> Pkce {
    let mut bytes = [0u8; 48];
    rand::rng().fill(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = compute_challenge(&verifier);
    Pkce {
        verifier,
        challenge,
    }
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Verify that a verifier matches a previously issued challenge.
///
/// Recomputes the S256 transform and compares in constant time. No side
/// effects; flipping any character of the verifier fails the check.
pub fn verify(verifier: &str, challenge: &str) -> bool {
    let computed = compute_challenge(verifier);
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}
