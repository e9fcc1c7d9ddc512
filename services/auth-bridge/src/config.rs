//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets (the upstream client secret and the consent cookie signing
//! key) are loaded from BRIDGE_CLIENT_SECRET / BRIDGE_COOKIE_SECRET env
//! vars or from `*_file` paths, never stored in the TOML directly.
//!
//! Everything that can fail at request time for configuration reasons is
//! validated here instead: endpoint URLs parse, `{tenant}` templates
//! resolve, OIDC providers carry a jwks_uri and issuer, and non-OIDC
//! providers carry a userinfo endpoint.

use bridge_auth::provider::{
    ClientAuthStyle, MissingRefreshPolicy, ProviderConfig, substitute_tenant,
};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub consent: ConsentConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Externally visible base URL; the upstream redirect_uri is
    /// `<public_url>/callback`
    pub public_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream identity provider, as written in the TOML. Endpoint fields
/// are templates that may contain `{tenant}`; `resolve()` turns this
/// into the validated `ProviderConfig` the bridge runs on.
#[derive(Debug, Deserialize)]
pub struct ProviderSettings {
    pub name: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to
    /// BRIDGE_CLIENT_SECRET env var)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    pub scopes: String,
    pub auth_style: ClientAuthStyle,
    #[serde(default)]
    pub use_nonce: bool,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default = "default_missing_refresh")]
    pub on_missing_refresh: MissingRefreshPolicy,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_secs: u64,
}

/// Consent cookie settings
#[derive(Debug, Deserialize)]
pub struct ConsentConfig {
    #[serde(skip)]
    pub cookie_secret: Option<Secret<String>>,
    #[serde(default)]
    pub cookie_secret_file: Option<PathBuf>,
    #[serde(default = "default_consent_ttl")]
    pub ttl_secs: u64,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            cookie_secret: None,
            cookie_secret_file: None,
            ttl_secs: default_consent_ttl(),
        }
    }
}

/// Pending-transaction settings
#[derive(Debug, Deserialize)]
pub struct TransactionConfig {
    #[serde(default = "default_txn_ttl")]
    pub ttl_secs: u64,
    /// Require the callback to arrive from the browser that approved
    /// consent (transaction cookie check)
    #[serde(default = "default_true")]
    pub bind_cookie: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_txn_ttl(),
            bind_cookie: true,
        }
    }
}

/// One registered downstream client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEntry {
    pub client_id: String,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_refresh_buffer() -> u64 {
    300
}

fn default_consent_ttl() -> u64 {
    31_536_000 // one year
}

fn default_txn_ttl() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_missing_refresh() -> MissingRefreshPolicy {
    MissingRefreshPolicy::Passthrough
}

impl ProviderSettings {
    /// Build the runtime `ProviderConfig`: substitute `{tenant}` in the
    /// endpoint templates and parse every endpoint as a URL.
    pub fn resolve(&self) -> common::Result<ProviderConfig> {
        let tenant = self.tenant.as_deref();
        let parse = |field: &str, template: &str| -> common::Result<Url> {
            let resolved = substitute_tenant(template, tenant)?;
            Url::parse(&resolved)
                .map_err(|e| common::Error::Config(format!("invalid {field} '{resolved}': {e}")))
        };

        let userinfo_endpoint = self
            .userinfo_endpoint
            .as_deref()
            .map(|t| parse("userinfo_endpoint", t))
            .transpose()?;
        let jwks_uri = self
            .jwks_uri
            .as_deref()
            .map(|t| parse("jwks_uri", t))
            .transpose()?;

        Ok(ProviderConfig {
            name: self.name.clone(),
            authorization_endpoint: parse("authorization_endpoint", &self.authorization_endpoint)?,
            token_endpoint: parse("token_endpoint", &self.token_endpoint)?,
            userinfo_endpoint,
            jwks_uri,
            issuer: self.issuer.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            scopes: self.scopes.clone(),
            auth_style: self.auth_style,
            use_nonce: self.use_nonce,
            on_missing_refresh: self.on_missing_refresh,
        })
    }
}

/// Resolve a secret: env var takes precedence over file.
fn resolve_secret(
    env_var: &str,
    file: Option<&Path>,
    what: &str,
) -> common::Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(Some(Secret::new(value)));
    }
    if let Some(path) = file {
        let value = std::fs::read_to_string(path).map_err(|e| {
            common::Error::Config(format!("failed to read {what} file {}: {e}", path.display()))
        })?;
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Some(Secret::new(value)));
        }
    }
    Ok(None)
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables and validate.
    ///
    /// Secret resolution order (each):
    /// 1. BRIDGE_CLIENT_SECRET / BRIDGE_COOKIE_SECRET env var
    /// 2. `*_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.server.public_url.starts_with("http://")
            && !config.server.public_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "public_url must start with http:// or https://, got: {}",
                config.server.public_url
            )));
        }
        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.provider.timeout_secs == 0 {
            return Err(common::Error::Config(
                "provider.timeout_secs must be greater than 0".into(),
            ));
        }
        if config.transaction.ttl_secs == 0 {
            return Err(common::Error::Config(
                "transaction.ttl_secs must be greater than 0".into(),
            ));
        }

        config.provider.client_secret = resolve_secret(
            "BRIDGE_CLIENT_SECRET",
            config.provider.client_secret_file.as_deref(),
            "client_secret",
        )?;
        config.consent.cookie_secret = resolve_secret(
            "BRIDGE_COOKIE_SECRET",
            config.consent.cookie_secret_file.as_deref(),
            "cookie_secret",
        )?;

        if config.consent.cookie_secret.is_none() {
            return Err(common::Error::Config(
                "consent cookie secret is required: set BRIDGE_COOKIE_SECRET or consent.cookie_secret_file".into(),
            ));
        }

        // Confidential auth styles need a secret; a public client must not
        // carry one silently
        match config.provider.auth_style {
            ClientAuthStyle::SecretPost | ClientAuthStyle::SecretBasic => {
                if config.provider.client_secret.is_none() {
                    return Err(common::Error::Config(format!(
                        "provider '{}' uses a confidential auth style but no client secret is set: \
                         set BRIDGE_CLIENT_SECRET or provider.client_secret_file",
                        config.provider.name
                    )));
                }
            }
            ClientAuthStyle::Public => {}
        }

        // OIDC providers validate ID tokens; everything else needs a
        // userinfo endpoint to learn who logged in
        if config.provider.use_nonce {
            if config.provider.jwks_uri.is_none() || config.provider.issuer.is_none() {
                return Err(common::Error::Config(format!(
                    "provider '{}' has use_nonce but is missing jwks_uri or issuer",
                    config.provider.name
                )));
            }
        } else if config.provider.userinfo_endpoint.is_none() {
            return Err(common::Error::Config(format!(
                "provider '{}' is not OIDC (use_nonce = false) and has no userinfo_endpoint; \
                 no way to resolve the user's identity",
                config.provider.name
            )));
        }

        if config.clients.is_empty() {
            return Err(common::Error::Config(
                "at least one [[clients]] entry is required".into(),
            ));
        }
        for client in &config.clients {
            if client.redirect_uris.is_empty() {
                return Err(common::Error::Config(format!(
                    "client '{}' has no redirect_uris",
                    client.client_id
                )));
            }
        }

        // Fail now, not on the first request, if endpoints don't resolve
        config.provider.resolve()?;

        Ok(config)
    }

    /// The bridge's upstream redirect URI.
    pub fn callback_url(&self) -> String {
        format!("{}/callback", self.server.public_url.trim_end_matches('/'))
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("auth-bridge.toml")
    }
}
