//! Upstream provider configuration and the authorize-URL builder
//!
//! One generic bridge parameterized by `ProviderConfig` replaces
//! per-provider handler copies: endpoint URLs, client authentication
//! style, whether the provider is OIDC (nonce + ID token validation), and
//! how to behave when it issues no refresh token. Provider differences
//! are strategy values, not duplicated control flow.
//!
//! Endpoints are stored as parsed `Url`s: the service validates them once
//! at startup (including `{tenant}` substitution), so URL construction
//! here is infallible and missing required configuration can never
//! surface as a per-request error.

use common::Secret;
use serde::Deserialize;
use url::Url;

/// How the bridge authenticates to the upstream token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthStyle {
    /// client_id + client_secret as form fields
    SecretPost,
    /// client_id:client_secret as HTTP Basic
    SecretBasic,
    /// public client, PKCE only
    Public,
}

/// Behavior of the refresh bridge when the session carries no upstream
/// refresh token. A deliberate per-provider choice, never a fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingRefreshPolicy {
    /// Hand the existing props through unchanged (non-expiring upstream
    /// tokens, GitHub-style)
    Passthrough,
    /// Fail the downstream refresh grant explicitly
    Reject,
}

/// Everything the bridge needs to know about one upstream provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Discriminator carried in SessionProps (e.g. "github", "entra")
    pub name: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub userinfo_endpoint: Option<Url>,
    pub jwks_uri: Option<Url>,
    /// Expected `iss` of ID tokens; required when `use_nonce` is set
    pub issuer: Option<String>,
    pub client_id: String,
    /// None only for `ClientAuthStyle::Public`
    pub client_secret: Option<Secret<String>>,
    /// Space-separated scope string requested upstream
    pub scopes: String,
    pub auth_style: ClientAuthStyle,
    /// OIDC providers: send a nonce and validate the returned ID token
    pub use_nonce: bool,
    pub on_missing_refresh: MissingRefreshPolicy,
}

impl ProviderConfig {
    /// Compose the upstream authorize URL.
    ///
    /// `callback_url` is the bridge's own callback, never the downstream
    /// client's redirect URI. `state` is the transaction handle. Every
    /// parameter is query-encoded by `Url`; `nonce` is included only for
    /// OIDC providers.
    pub fn authorize_url(
        &self,
        callback_url: &str,
        code_challenge: &str,
        nonce: &str,
        state: &str,
    ) -> Url {
        let mut url = self.authorization_endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", callback_url)
                .append_pair("scope", &self.scopes)
                .append_pair("state", state)
                .append_pair("code_challenge", code_challenge)
                .append_pair("code_challenge_method", "S256");
            if self.use_nonce {
                pairs.append_pair("nonce", nonce);
            }
        }
        url
    }
}

/// Substitute the `{tenant}` placeholder in a multi-tenant endpoint
/// template. Returns an error when the template needs a tenant and none
/// is configured — callers treat that as startup-fatal.
pub fn substitute_tenant(template: &str, tenant: Option<&str>) -> common::Result<String> {
    if !template.contains("{tenant}") {
        return Ok(template.to_string());
    }
    match tenant {
        Some(t) => Ok(template.replace("{tenant}", t)),
        None => Err(common::Error::Config(format!(
            "endpoint template '{template}' contains {{tenant}} but no tenant is configured"
        ))),
    }
}
