//! ID-token validation and identity resolution
//!
//! OIDC providers return an ID token from the code exchange; it is
//! validated against the provider's JWKS (signature), expected issuer,
//! audience (our client_id), and the transaction's nonce. Providers
//! without OIDC expose a userinfo/profile endpoint instead, whose JSON is
//! normalized into the same `IdentityClaims` shape — `sub`/`id` for the
//! subject, `name`/`login`/`preferred_username` for the display name.

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::props::IdentityClaims;

/// Claims extracted from a validated ID token. Registered claims (iss,
/// aud, exp) are checked by the decoder; only the ones the bridge uses
/// afterwards are kept here.
#[derive(Debug, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

impl IdTokenClaims {
    pub fn identity(&self) -> IdentityClaims {
        IdentityClaims {
            subject: self.sub.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// Fetch the provider's JWKS document.
pub async fn fetch_jwks(client: &reqwest::Client, jwks_uri: &Url) -> Result<JwkSet> {
    let response = client
        .get(jwks_uri.clone())
        .send()
        .await
        .map_err(|e| Error::Http(format!("jwks fetch failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Http(format!("jwks endpoint returned {status}")));
    }

    response
        .json::<JwkSet>()
        .await
        .map_err(|e| Error::Claims(format!("invalid jwks document: {e}")))
}

/// Validate an ID token: signature against the JWKS, issuer, audience,
/// and nonce. Any mismatch rejects the whole token.
///
/// `expected_nonce` is the nonce stored in the transaction; None skips
/// the nonce check (refresh-time re-validation, where no nonce exists).
pub fn validate_id_token(
    id_token: &str,
    jwks: &JwkSet,
    issuer: Option<&str>,
    audience: &str,
    expected_nonce: Option<&str>,
) -> Result<IdTokenClaims> {
    let header =
        decode_header(id_token).map_err(|e| Error::Claims(format!("bad id_token header: {e}")))?;

    let jwk = match header.kid.as_deref() {
        Some(kid) => jwks
            .find(kid)
            .ok_or_else(|| Error::Claims(format!("no jwks key with kid '{kid}'")))?,
        // Providers with a single signing key sometimes omit the kid
        None if jwks.keys.len() == 1 => &jwks.keys[0],
        None => return Err(Error::Claims("id_token has no kid".into())),
    };

    let key =
        DecodingKey::from_jwk(jwk).map_err(|e| Error::Claims(format!("unusable jwks key: {e}")))?;

    let mut validation = Validation::new(header.alg);
    validation.set_audience(&[audience]);
    if let Some(iss) = issuer {
        validation.set_issuer(&[iss]);
    }

    let data = decode::<IdTokenClaims>(id_token, &key, &validation)
        .map_err(|e| Error::Claims(format!("id_token validation failed: {e}")))?;

    if let Some(expected) = expected_nonce {
        match data.claims.nonce.as_deref() {
            Some(nonce) if nonce == expected => {}
            Some(_) => return Err(Error::Claims("id_token nonce mismatch".into())),
            None => return Err(Error::Claims("id_token missing expected nonce".into())),
        }
    }

    Ok(data.claims)
}

/// Fetch the userinfo/profile endpoint with the access token and
/// normalize the response.
pub async fn fetch_userinfo(
    client: &reqwest::Client,
    endpoint: &Url,
    access_token: &str,
) -> Result<IdentityClaims> {
    let response = client
        .get(endpoint.clone())
        .bearer_auth(access_token)
        .header("accept", "application/json")
        .send()
        .await
        .map_err(|e| Error::Http(format!("userinfo request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Http(format!("userinfo endpoint returned {status}")));
    }

    let value = response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| Error::Claims(format!("invalid userinfo response: {e}")))?;

    normalize_userinfo(&value)
}

/// Map a provider userinfo payload onto `IdentityClaims`.
///
/// Subject comes from `sub` (OIDC) or `id` (GitHub/Atlassian-style,
/// string or number). A payload with neither is rejected — an identity
/// without a stable subject cannot key a session.
pub fn normalize_userinfo(value: &serde_json::Value) -> Result<IdentityClaims> {
    let subject = value
        .get("sub")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value.get("id").map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
        .ok_or_else(|| Error::Claims("userinfo has neither 'sub' nor 'id'".into()))?;

    let name = ["name", "login", "preferred_username"]
        .iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.to_string());

    let email = value
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(IdentityClaims {
        subject,
        name,
        email,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use serde_json::json;

    const TEST_SECRET: &[u8] = b"test-oct-signing-key-for-id-tokens";

    /// JWKS with one symmetric (oct) key — lets tests exercise the full
    /// signature path without generating RSA material.
    fn test_jwks(kid: &str) -> JwkSet {
        let jwks = json!({
            "keys": [{
                "kty": "oct",
                "kid": kid,
                "alg": "HS256",
                "k": URL_SAFE_NO_PAD.encode(TEST_SECRET),
            }]
        });
        serde_json::from_value(jwks).unwrap()
    }

    fn sign_id_token(claims: serde_json::Value, kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(|s| s.to_string());
        encode(
            &header,
            &claims,
            &EncodingKey::from_secret(TEST_SECRET),
        )
        .unwrap()
    }

    fn valid_claims() -> serde_json::Value {
        json!({
            "iss": "https://idp.example.com",
            "aud": "bridge-client",
            "sub": "user-42",
            "name": "Ada Lovelace",
            "email": "ada@example.com",
            "nonce": "nonce-1",
            "exp": 4_102_444_800u64,
        })
    }

    #[test]
    fn valid_id_token_passes_and_normalizes() {
        let token = sign_id_token(valid_claims(), Some("k1"));
        let claims = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://idp.example.com"),
            "bridge-client",
            Some("nonce-1"),
        )
        .unwrap();

        assert_eq!(claims.sub, "user-42");
        let identity = claims.identity();
        assert_eq!(identity.subject, "user-42");
        assert_eq!(identity.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(identity.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn nonce_mismatch_is_rejected() {
        let token = sign_id_token(valid_claims(), Some("k1"));
        let err = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://idp.example.com"),
            "bridge-client",
            Some("a-different-nonce"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("nonce"), "got: {err}");
    }

    #[test]
    fn missing_nonce_when_expected_is_rejected() {
        let mut claims = valid_claims();
        claims.as_object_mut().unwrap().remove("nonce");
        let token = sign_id_token(claims, Some("k1"));
        let err = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://idp.example.com"),
            "bridge-client",
            Some("nonce-1"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("nonce"), "got: {err}");
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let token = sign_id_token(valid_claims(), Some("k1"));
        let err = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://evil.example.com"),
            "bridge-client",
            Some("nonce-1"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Claims(_)));
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let token = sign_id_token(valid_claims(), Some("k1"));
        let err = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://idp.example.com"),
            "someone-else",
            Some("nonce-1"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Claims(_)));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mut token = sign_id_token(valid_claims(), Some("k1"));
        // Corrupt the signature segment
        token.pop();
        token.push('A');
        let result = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://idp.example.com"),
            "bridge-client",
            Some("nonce-1"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_kid_is_rejected() {
        let token = sign_id_token(valid_claims(), Some("k2"));
        let err = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://idp.example.com"),
            "bridge-client",
            Some("nonce-1"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("kid"), "got: {err}");
    }

    #[test]
    fn missing_kid_falls_back_to_single_key() {
        let token = sign_id_token(valid_claims(), None);
        let claims = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://idp.example.com"),
            "bridge-client",
            Some("nonce-1"),
        )
        .unwrap();
        assert_eq!(claims.sub, "user-42");
    }

    #[test]
    fn refresh_time_revalidation_skips_nonce() {
        let mut claims = valid_claims();
        claims.as_object_mut().unwrap().remove("nonce");
        let token = sign_id_token(claims, Some("k1"));
        let claims = validate_id_token(
            &token,
            &test_jwks("k1"),
            Some("https://idp.example.com"),
            "bridge-client",
            None,
        )
        .unwrap();
        assert_eq!(claims.sub, "user-42");
    }

    #[test]
    fn normalize_oidc_userinfo() {
        let identity = normalize_userinfo(&json!({
            "sub": "user-7",
            "name": "Grace",
            "email": "grace@example.com",
        }))
        .unwrap();
        assert_eq!(identity.subject, "user-7");
        assert_eq!(identity.name.as_deref(), Some("Grace"));
        assert_eq!(identity.email.as_deref(), Some("grace@example.com"));
    }

    #[test]
    fn normalize_github_style_profile() {
        let identity = normalize_userinfo(&json!({
            "id": 583231,
            "login": "octocat",
            "email": null,
        }))
        .unwrap();
        assert_eq!(identity.subject, "583231");
        assert_eq!(identity.name.as_deref(), Some("octocat"));
        assert!(identity.email.is_none());
    }

    #[test]
    fn normalize_without_subject_fails() {
        let err = normalize_userinfo(&json!({"login": "nobody"})).unwrap_err();
        assert!(matches!(err, Error::Claims(_)));
    }
}
