//! Downstream issuer: the authorization-server face of the bridge
//!
//! The bridge's own protocol logic (consent, transactions, upstream
//! exchange) never mints downstream tokens itself — it hands the
//! finished `SessionProps` to an `Issuer`. The trait is the seam where a
//! real MCP authorization server plugs in; `ReferenceIssuer` is the
//! built-in implementation backed by the session store, good enough for
//! single-instance deployments and for exercising the full flow in
//! tests.
//!
//! Reference issuer token model: downstream codes are single-use store
//! entries with a short TTL, downstream access tokens are opaque store
//! entries whose TTL the `TokenBridge` aligns with the upstream token,
//! and downstream refresh tokens are long-lived grant records that carry
//! the upstream `SessionProps` forward.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bridge_auth::props::SessionProps;
use bridge_auth::refresh::{self, GrantKind, GrantOutcome};
use bridge_auth::{ProviderConfig, pkce};
use bridge_store::store::SessionStore;
use bridge_store::transaction::AuthorizationRequest;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::config::ClientEntry;
use crate::error::{ApiError, Result};
use crate::metrics;

/// Downstream authorization codes are redeemed within seconds.
const CODE_TTL: Duration = Duration::from_secs(60);

/// Access-token TTL when the upstream declared no expiry.
const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(3600);

/// A registered downstream client.
#[derive(Debug, Clone)]
pub struct ClientMetadata {
    pub client_id: String,
    pub redirect_uris: Vec<String>,
    pub name: Option<String>,
}

impl From<ClientEntry> for ClientMetadata {
    fn from(entry: ClientEntry) -> Self {
        Self {
            client_id: entry.client_id,
            redirect_uris: entry.redirect_uris,
            name: entry.name,
        }
    }
}

impl ClientMetadata {
    /// Exact string match, per OAuth 2.1. No prefix or pattern matching.
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == redirect_uri)
    }
}

/// The POST /token form, both grant types.
#[derive(Debug, Deserialize)]
pub struct TokenGrantForm {
    pub grant_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The POST /token response body.
#[derive(Debug, Serialize)]
pub struct TokenGrantResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Where a real authorization server plugs into the bridge.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Issuer>`).
pub trait Issuer: Send + Sync {
    /// Resolve a downstream client_id; None means unregistered.
    fn lookup_client<'a>(
        &'a self,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<ClientMetadata>> + Send + 'a>>;

    /// Mint a downstream authorization code for the finished flow and
    /// return the redirect URL (redirect_uri + code + original state).
    fn complete_authorization(
        &self,
        request: AuthorizationRequest,
        props: SessionProps,
    ) -> Pin<Box<dyn Future<Output = Result<Url>> + Send + '_>>;

    /// Handle a downstream token grant.
    fn token_grant(
        &self,
        form: TokenGrantForm,
    ) -> Pin<Box<dyn Future<Output = Result<TokenGrantResponse>> + Send + '_>>;
}

/// Runs the lazy refresh bridge against the configured upstream.
pub struct TokenBridge {
    http: reqwest::Client,
    provider: ProviderConfig,
    buffer: Duration,
}

impl TokenBridge {
    pub fn new(http: reqwest::Client, provider: ProviderConfig, buffer: Duration) -> Self {
        Self {
            http,
            provider,
            buffer,
        }
    }

    pub async fn on_grant(
        &self,
        kind: GrantKind,
        props: SessionProps,
    ) -> bridge_auth::Result<GrantOutcome> {
        let before = props.tokens.access_token.clone();
        let outcome = refresh::on_grant(&self.http, &self.provider, kind, props, self.buffer).await?;
        if outcome.props.tokens.access_token != before {
            metrics::record_upstream("refresh");
        }
        Ok(outcome)
    }
}

/// What a downstream code entitles its bearer to redeem.
#[derive(Debug, Serialize, Deserialize)]
struct CodeRecord {
    client_id: String,
    redirect_uri: String,
    scope: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    props: SessionProps,
}

/// One downstream refresh-token grant.
#[derive(Debug, Serialize, Deserialize)]
struct GrantRecord {
    client_id: String,
    scope: Option<String>,
    props: SessionProps,
}

/// Built-in issuer backed by the session store.
pub struct ReferenceIssuer {
    clients: HashMap<String, ClientMetadata>,
    store: Arc<dyn SessionStore>,
    bridge: Arc<TokenBridge>,
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ApiError::Internal(e.to_string()))
}

fn from_json<T: for<'de> Deserialize<'de>>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| ApiError::Internal(e.to_string()))
}

impl ReferenceIssuer {
    pub fn new(
        clients: Vec<ClientEntry>,
        store: Arc<dyn SessionStore>,
        bridge: Arc<TokenBridge>,
    ) -> Self {
        let clients = clients
            .into_iter()
            .map(|entry| (entry.client_id.clone(), ClientMetadata::from(entry)))
            .collect();
        Self {
            clients,
            store,
            bridge,
        }
    }

    async fn code_grant(&self, form: TokenGrantForm) -> Result<TokenGrantResponse> {
        let code = form
            .code
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("code is required".into()))?;
        let client_id = form
            .client_id
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("client_id is required".into()))?;
        if !self.clients.contains_key(client_id) {
            return Err(ApiError::InvalidClient);
        }

        // Single-use: first redemption wins, replays get invalid_grant
        let record: CodeRecord = {
            let json = self
                .store
                .take(&format!("code:{code}"))
                .await?
                .ok_or_else(|| ApiError::InvalidGrant("invalid or expired code".into()))?;
            from_json(&json)?
        };

        if record.client_id != client_id {
            return Err(ApiError::InvalidGrant("code issued to another client".into()));
        }
        match (form.redirect_uri.as_deref(), record.redirect_uri.as_str()) {
            (Some(sent), bound) if sent == bound => {}
            (None, _) => {
                return Err(ApiError::InvalidRequest("redirect_uri is required".into()));
            }
            _ => return Err(ApiError::InvalidGrant("redirect_uri mismatch".into())),
        }

        // Downstream PKCE: mandatory when the authorize request carried a
        // challenge
        if let Some(challenge) = &record.code_challenge {
            let verifier = form
                .code_verifier
                .as_deref()
                .ok_or_else(|| ApiError::InvalidGrant("code_verifier is required".into()))?;
            if !pkce::verify(verifier, challenge) {
                return Err(ApiError::InvalidGrant("code_verifier does not match".into()));
            }
        }

        let outcome = self
            .bridge
            .on_grant(GrantKind::AuthorizationCode, record.props)
            .await?;

        let access_token = new_token();
        let refresh_token = new_token();
        let access_ttl = outcome.access_token_ttl.unwrap_or(DEFAULT_ACCESS_TTL);

        self.store
            .put(
                &format!("access:{access_token}"),
                to_json(&outcome.props.claims)?,
                Some(access_ttl),
            )
            .await?;
        let grant = GrantRecord {
            client_id: client_id.to_string(),
            scope: record.scope.clone(),
            props: outcome.props,
        };
        self.store
            .put(
                &format!("grant:{refresh_token}"),
                to_json(&grant)?,
                outcome.refresh_token_ttl,
            )
            .await?;

        info!(client_id, subject = %grant.props.claims.subject, "authorization code redeemed");
        Ok(TokenGrantResponse {
            access_token,
            token_type: "Bearer".into(),
            expires_in: Some(access_ttl.as_secs()),
            refresh_token: Some(refresh_token),
            scope: record.scope,
        })
    }

    async fn refresh_grant(&self, form: TokenGrantForm) -> Result<TokenGrantResponse> {
        let refresh_token = form
            .refresh_token
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("refresh_token is required".into()))?;
        let client_id = form
            .client_id
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("client_id is required".into()))?;
        if !self.clients.contains_key(client_id) {
            return Err(ApiError::InvalidClient);
        }

        let grant_key = format!("grant:{refresh_token}");
        let record: GrantRecord = {
            let json = self
                .store
                .get(&grant_key)
                .await?
                .ok_or_else(|| ApiError::InvalidGrant("invalid refresh token".into()))?;
            from_json(&json)?
        };
        if record.client_id != client_id {
            return Err(ApiError::InvalidGrant(
                "refresh token issued to another client".into(),
            ));
        }

        // A dead upstream refresh token kills the downstream grant too
        let outcome = match self
            .bridge
            .on_grant(GrantKind::RefreshToken, record.props)
            .await
        {
            Ok(outcome) => outcome,
            Err(err @ bridge_auth::Error::InvalidGrant(_)) => {
                self.store.delete(&grant_key).await?;
                debug!(client_id, "upstream refresh rejected, grant revoked");
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let access_token = new_token();
        let access_ttl = outcome.access_token_ttl.unwrap_or(DEFAULT_ACCESS_TTL);
        self.store
            .put(
                &format!("access:{access_token}"),
                to_json(&outcome.props.claims)?,
                Some(access_ttl),
            )
            .await?;

        // Downstream refresh token is stable; only the carried props move
        let updated = GrantRecord {
            client_id: record.client_id,
            scope: record.scope.clone(),
            props: outcome.props,
        };
        self.store
            .put(&grant_key, to_json(&updated)?, outcome.refresh_token_ttl)
            .await?;

        Ok(TokenGrantResponse {
            access_token,
            token_type: "Bearer".into(),
            expires_in: Some(access_ttl.as_secs()),
            refresh_token: None,
            scope: record.scope,
        })
    }
}

impl Issuer for ReferenceIssuer {
    fn lookup_client<'a>(
        &'a self,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<ClientMetadata>> + Send + 'a>> {
        Box::pin(async move { self.clients.get(client_id).cloned() })
    }

    fn complete_authorization(
        &self,
        request: AuthorizationRequest,
        props: SessionProps,
    ) -> Pin<Box<dyn Future<Output = Result<Url>> + Send + '_>> {
        Box::pin(async move {
            let code = new_token();
            let record = CodeRecord {
                client_id: request.client_id.clone(),
                redirect_uri: request.redirect_uri.clone(),
                scope: request.scope.clone(),
                code_challenge: request.code_challenge.clone(),
                code_challenge_method: request.code_challenge_method.clone(),
                props,
            };
            self.store
                .put(&format!("code:{code}"), to_json(&record)?, Some(CODE_TTL))
                .await?;

            let mut url = Url::parse(&request.redirect_uri)
                .map_err(|e| ApiError::Internal(format!("stored redirect_uri unparseable: {e}")))?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("code", &code);
                if let Some(state) = &request.state {
                    pairs.append_pair("state", state);
                }
            }
            Ok(url)
        })
    }

    fn token_grant(
        &self,
        form: TokenGrantForm,
    ) -> Pin<Box<dyn Future<Output = Result<TokenGrantResponse>> + Send + '_>> {
        Box::pin(async move {
            match form.grant_type.as_str() {
                "authorization_code" => self.code_grant(form).await,
                "refresh_token" => self.refresh_grant(form).await,
                other => Err(ApiError::InvalidRequest(format!(
                    "unsupported grant_type '{other}'"
                ))),
            }
        })
    }
}
