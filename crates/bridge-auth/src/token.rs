//! Upstream token endpoint access
//!
//! The two token-endpoint interactions the bridge performs:
//! 1. Authorization-code exchange during the callback (with the stored
//!    PKCE verifier)
//! 2. Token refresh, driven lazily by the refresh bridge
//!
//! Both POST a form to the provider's token endpoint. Client
//! authentication follows `ClientAuthStyle`: secret as a form field,
//! HTTP Basic, or nothing beyond `client_id` for public PKCE-only
//! clients. The `reqwest::Client` is expected to carry the process-wide
//! upstream timeout; a timeout surfaces as `Error::Http`, never a hang.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::provider::{ClientAuthStyle, ProviderConfig};

/// Response from the upstream token endpoint for both exchange and
/// refresh.
///
/// Only `access_token` is guaranteed; everything else is
/// provider-dependent. `expires_in` is a delta in seconds — callers
/// convert to absolute unix millis at receipt time.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token_expires_in: Option<u64>,
}

/// Exchange an authorization code for tokens.
///
/// `redirect_uri` must be the exact callback URL sent in the authorize
/// redirect, and `verifier` the PKCE verifier stored in the transaction.
pub async fn exchange_code(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("code_verifier", verifier),
        ("client_id", &cfg.client_id),
    ];
    post_token(client, cfg, &params, "token exchange").await
}

/// Refresh an access token using an upstream refresh token.
///
/// Called only by the refresh bridge when the access token is inside the
/// refresh buffer. A 401/403 means the upstream session is gone and maps
/// to `Error::InvalidGrant` so the downstream grant fails rather than
/// retries.
pub async fn refresh(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", &cfg.client_id),
    ];
    post_token(client, cfg, &params, "token refresh").await
}

async fn post_token(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    params: &[(&str, &str)],
    op: &str,
) -> Result<TokenResponse> {
    let mut form: Vec<(&str, &str)> = params.to_vec();

    let mut request = client.post(cfg.token_endpoint.clone());
    match cfg.auth_style {
        ClientAuthStyle::SecretPost => {
            if let Some(secret) = &cfg.client_secret {
                form.push(("client_secret", secret.expose()));
            }
        }
        ClientAuthStyle::SecretBasic => {
            if let Some(secret) = &cfg.client_secret {
                request = request.basic_auth(&cfg.client_id, Some(secret.expose()));
            }
        }
        ClientAuthStyle::Public => {}
    }

    let response = request
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("{op} request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the grant itself is rejected, not a transient fault
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidGrant(format!(
                "{op} rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    // A 2xx without access_token deserializes to an error here, which is
    // exactly the rejection the callback flow needs.
    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid {op} response: {e}")))
}
