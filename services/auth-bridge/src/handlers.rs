//! HTTP surface of the bridge
//!
//! Routes:
//! - `GET /authorize` — downstream entry point; renders consent or, for a
//!   returning browser, redirects straight upstream
//! - `POST /authorize` — consent decision (CSRF-checked)
//! - `GET /callback` — upstream return leg; exchanges the code and
//!   completes the downstream flow
//! - `POST /token` — downstream token endpoint (delegated to the issuer)
//! - `GET /health`, `GET /metrics` — operational endpoints
//!
//! Redirect discipline: the bridge only ever redirects to a redirect_uri
//! it has verified against the client registration for this request.
//! Unknown clients and unregistered redirect URIs get a 400 rendered to
//! the user agent instead.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use bridge_auth::props::{SessionProps, TokenSet, expires_at_from, now_millis};
use bridge_auth::{ProviderConfig, claims, consent, csrf, token};
use bridge_store::transaction::{AuthorizationRequest, TransactionManager};
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tower_cookies::cookie::SameSite;
use tower_cookies::{Cookie, Cookies};
use tracing::{Instrument, debug, info, warn};
use url::Url;

use crate::downstream::{ClientMetadata, Issuer, TokenGrantForm};
use crate::error::{ApiError, Result};
use crate::metrics;

const CONSENT_COOKIE: &str = "bridge_consent";
const CSRF_COOKIE: &str = "bridge_csrf";
const TXN_COOKIE: &str = "bridge_txn";

/// The CSRF cookie only needs to survive the consent page round-trip.
const CSRF_COOKIE_TTL_SECS: i64 = 600;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<ProviderConfig>,
    pub callback_url: Arc<String>,
    pub cookie_secret: Arc<Secret<String>>,
    pub consent_ttl_secs: u64,
    pub bind_txn_cookie: bool,
    /// Set Secure on every cookie; derived from the public URL scheme so
    /// plain-http local runs still see their cookies.
    pub secure_cookies: bool,
    pub transactions: Arc<TransactionManager>,
    pub issuer: Arc<dyn Issuer>,
    pub http: reqwest::Client,
    pub prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/authorize", get(authorize_get).post(authorize_post))
        .route("/callback", get(callback_handler))
        .route("/token", post(token_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower_cookies::CookieManagerLayer::new())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// The downstream authorization request as it arrives on the query
/// string.
#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    response_type: String,
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
}

/// The consent decision form. Request fields ride along as hidden inputs
/// so the POST is self-contained.
#[derive(Debug, Deserialize)]
struct ConsentForm {
    consent_action: String,
    csrf_token: String,
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
}

/// The upstream provider's return leg.
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Validate client_id + redirect_uri against the registration. Failures
/// are rendered, never redirected.
async fn verify_client(
    issuer: &Arc<dyn Issuer>,
    client_id: &str,
    redirect_uri: &str,
) -> Result<ClientMetadata> {
    let client = issuer
        .lookup_client(client_id)
        .await
        .ok_or_else(|| ApiError::InvalidRequest(format!("unknown client_id '{client_id}'")))?;
    if !client.allows_redirect(redirect_uri) {
        return Err(ApiError::InvalidRequest(
            "redirect_uri is not registered for this client".into(),
        ));
    }
    Ok(client)
}

fn validate_challenge_method(method: Option<&str>) -> Result<()> {
    match method {
        None | Some("S256") => Ok(()),
        Some(other) => Err(ApiError::InvalidRequest(format!(
            "unsupported code_challenge_method '{other}'"
        ))),
    }
}

fn found(location: &Url) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

/// Redirect back to a *verified* downstream redirect_uri with an OAuth
/// error.
fn error_redirect(redirect_uri: &str, error: &str, state: Option<&str>) -> Result<Response> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| ApiError::Internal(format!("verified redirect_uri unparseable: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("error", error);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    Ok(found(&url))
}

/// Open a transaction for an approved request and send the user agent
/// upstream.
async fn redirect_upstream(
    state: &AppState,
    cookies: &Cookies,
    request: AuthorizationRequest,
) -> Result<Response> {
    let client_id = request.client_id.clone();
    let opened = state.transactions.open(request).await?;

    if state.bind_txn_cookie {
        cookies.add(
            Cookie::build((TXN_COOKIE, opened.handle.clone()))
                .path("/")
                .http_only(true)
                .secure(state.secure_cookies)
                .same_site(SameSite::Lax)
                .build(),
        );
    }

    let url = state.provider.authorize_url(
        &state.callback_url,
        &opened.code_challenge,
        &opened.nonce,
        &opened.handle,
    );
    info!(client_id, provider = %state.provider.name, "redirecting upstream");
    Ok(found(&url))
}

async fn authorize_get(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response> {
    let started = Instant::now();

    if query.response_type != "code" {
        return Err(ApiError::InvalidRequest(format!(
            "unsupported response_type '{}'",
            query.response_type
        )));
    }
    let client = verify_client(&state.issuer, &query.client_id, &query.redirect_uri).await?;
    validate_challenge_method(query.code_challenge_method.as_deref())?;

    let request = AuthorizationRequest {
        client_id: query.client_id,
        redirect_uri: query.redirect_uri,
        scope: query.scope,
        state: query.state,
        code_challenge: query.code_challenge,
        code_challenge_method: query.code_challenge_method,
    };

    let consent_cookie = cookies.get(CONSENT_COOKIE);
    let response = if consent::is_approved(
        consent_cookie.as_ref().map(|c| c.value()),
        &request.client_id,
        &state.cookie_secret,
    ) {
        debug!(client_id = %request.client_id, "consent previously granted, skipping page");
        redirect_upstream(&state, &cookies, request).await?
    } else {
        let csrf_token = csrf::issue();
        cookies.add(
            Cookie::build((CSRF_COOKIE, csrf_token.clone()))
                .path("/")
                .http_only(true)
                .secure(state.secure_cookies)
                .same_site(SameSite::Lax)
                .max_age(tower_cookies::cookie::time::Duration::seconds(
                    CSRF_COOKIE_TTL_SECS,
                ))
                .build(),
        );
        Html(consent_page(&client, &request, &csrf_token)).into_response()
    };

    metrics::record_duration("/authorize", started.elapsed().as_secs_f64());
    Ok(response)
}

async fn authorize_post(
    State(state): State<AppState>,
    cookies: Cookies,
    axum::extract::Form(form): axum::extract::Form<ConsentForm>,
) -> Result<Response> {
    let started = Instant::now();

    // Double-submit check: hidden field vs cookie, constant time
    let cookie_token = cookies
        .get(CSRF_COOKIE)
        .map(|c| c.value().to_string())
        .unwrap_or_default();
    if !csrf::validate(&form.csrf_token, &cookie_token) {
        warn!(client_id = %form.client_id, "consent POST failed CSRF check");
        return Err(ApiError::InvalidRequest("CSRF token mismatch".into()));
    }
    cookies.remove(Cookie::build((CSRF_COOKIE, "")).path("/").build());

    // Hidden fields are attacker-writable; verify them like a fresh request
    verify_client(&state.issuer, &form.client_id, &form.redirect_uri).await?;
    validate_challenge_method(form.code_challenge_method.as_deref())?;

    let response = match form.consent_action.as_str() {
        "deny" => {
            info!(client_id = %form.client_id, "consent denied");
            metrics::record_flow("denied");
            error_redirect(&form.redirect_uri, "access_denied", form.state.as_deref())?
        }
        "approve" => {
            let existing = cookies.get(CONSENT_COOKIE).map(|c| c.value().to_string());
            let updated = consent::record_approval(
                existing.as_deref(),
                &form.client_id,
                &state.cookie_secret,
            );
            cookies.add(
                Cookie::build((CONSENT_COOKIE, updated))
                    .path("/")
                    .http_only(true)
                    .secure(state.secure_cookies)
                    .same_site(SameSite::Lax)
                    .max_age(tower_cookies::cookie::time::Duration::seconds(
                        state.consent_ttl_secs as i64,
                    ))
                    .build(),
            );

            let request = AuthorizationRequest {
                client_id: form.client_id,
                redirect_uri: form.redirect_uri,
                scope: form.scope,
                state: form.state,
                code_challenge: form.code_challenge,
                code_challenge_method: form.code_challenge_method,
            };
            redirect_upstream(&state, &cookies, request).await?
        }
        other => {
            return Err(ApiError::InvalidRequest(format!(
                "unknown consent action '{other}'"
            )));
        }
    };

    metrics::record_duration("/authorize", started.elapsed().as_secs_f64());
    Ok(response)
}

async fn callback_handler(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    let started = Instant::now();
    let flow_id = format!("flow_{}", uuid::Uuid::new_v4().as_simple());
    let result = handle_callback(&state, &cookies, query)
        .instrument(tracing::info_span!("callback", flow_id))
        .await;
    metrics::record_duration("/callback", started.elapsed().as_secs_f64());
    result
}

async fn handle_callback(
    state: &AppState,
    cookies: &Cookies,
    query: CallbackQuery,
) -> Result<Response> {
    let Some(handle) = query.state.as_deref() else {
        metrics::record_flow("invalid_state");
        return Err(ApiError::InvalidState);
    };

    // Consume first: even an upstream error burns the transaction
    let txn = match state.transactions.consume(handle).await {
        Ok(txn) => txn,
        Err(err) => {
            metrics::record_flow("invalid_state");
            return Err(err.into());
        }
    };

    if state.bind_txn_cookie {
        let bound = cookies
            .get(TXN_COOKIE)
            .map(|c| c.value().to_string())
            .unwrap_or_default();
        if !csrf::validate(handle, &bound) {
            warn!("callback arrived without the transaction cookie");
            metrics::record_flow("invalid_state");
            return Err(ApiError::InvalidState);
        }
        cookies.remove(Cookie::build((TXN_COOKIE, "")).path("/").build());
    }

    // Upstream said no (user cancelled at the provider, policy denial).
    // The transaction was valid, so the downstream client gets the error.
    if let Some(error) = query.error.as_deref() {
        warn!(
            error,
            description = query.error_description.as_deref().unwrap_or(""),
            "upstream authorization failed"
        );
        metrics::record_flow("upstream_denied");
        let code = if error == "access_denied" {
            "access_denied"
        } else {
            "server_error"
        };
        return error_redirect(&txn.request.redirect_uri, code, txn.request.state.as_deref());
    }

    let Some(code) = query.code.as_deref() else {
        metrics::record_flow("upstream_error");
        return Err(ApiError::InvalidRequest(
            "callback carries neither code nor error".into(),
        ));
    };

    metrics::record_upstream("exchange");
    let response = match token::exchange_code(
        &state.http,
        &state.provider,
        code,
        &txn.code_verifier,
        &state.callback_url,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => {
            metrics::record_flow("upstream_error");
            return Err(err.into());
        }
    };

    let now = now_millis();
    let tokens = TokenSet {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        id_token: response.id_token.clone(),
        expires_at: response.expires_in.map(|s| expires_at_from(now, s)),
        refresh_expires_at: response
            .refresh_token_expires_in
            .map(|s| expires_at_from(now, s)),
    };

    let claims = match resolve_identity(state, &tokens, response.id_token.as_deref(), &txn.nonce)
        .await
    {
        Ok(claims) => claims,
        Err(err) => {
            metrics::record_flow("upstream_error");
            return Err(err);
        }
    };

    let props = SessionProps {
        provider: state.provider.name.clone(),
        tokens,
        claims,
    };

    info!(
        client_id = %txn.request.client_id,
        subject = %props.claims.subject,
        provider = %props.provider,
        "authorization flow completed"
    );
    let redirect = state
        .issuer
        .complete_authorization(txn.request, props)
        .await?;
    metrics::record_flow("completed");
    Ok(found(&redirect))
}

/// OIDC: validate the ID token (signature, issuer, audience, nonce).
/// Otherwise: fetch and normalize the userinfo/profile endpoint.
async fn resolve_identity(
    state: &AppState,
    tokens: &TokenSet,
    id_token: Option<&str>,
    nonce: &str,
) -> Result<bridge_auth::IdentityClaims> {
    if state.provider.use_nonce {
        let id_token = id_token.ok_or_else(|| {
            ApiError::Upstream("OIDC provider returned no id_token".into())
        })?;
        let jwks_uri = state
            .provider
            .jwks_uri
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OIDC provider without jwks_uri".into()))?;
        metrics::record_upstream("jwks");
        let jwks = claims::fetch_jwks(&state.http, jwks_uri).await?;
        let validated = claims::validate_id_token(
            id_token,
            &jwks,
            state.provider.issuer.as_deref(),
            &state.provider.client_id,
            Some(nonce),
        )?;
        return Ok(validated.identity());
    }

    let endpoint = state
        .provider
        .userinfo_endpoint
        .as_ref()
        .ok_or_else(|| ApiError::Internal("provider without identity source".into()))?;
    metrics::record_upstream("userinfo");
    Ok(claims::fetch_userinfo(&state.http, endpoint, &tokens.access_token).await?)
}

async fn token_handler(
    State(state): State<AppState>,
    axum::extract::Form(form): axum::extract::Form<TokenGrantForm>,
) -> Result<Response> {
    let started = Instant::now();
    let response = state.issuer.token_grant(form).await?;
    metrics::record_duration("/token", started.elapsed().as_secs_f64());
    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(response),
    )
        .into_response())
}

/// Health endpoint: the bridge has no persistent connections to check,
/// so reachable means healthy.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "provider": state.provider.name,
    }))
}

/// Prometheus metrics endpoint — text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Minimal HTML escaping for text and attribute positions.
fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

fn hidden_field(name: &str, value: Option<&str>) -> String {
    match value {
        Some(v) => format!(
            r#"<input type="hidden" name="{name}" value="{}">"#,
            escape_html(v)
        ),
        None => String::new(),
    }
}

/// Render the consent page. Every interpolated value is escaped; the
/// request fields ride along as hidden inputs.
fn consent_page(client: &ClientMetadata, request: &AuthorizationRequest, csrf_token: &str) -> String {
    let display_name = client.name.as_deref().unwrap_or(&client.client_id);
    let scope_line = match request.scope.as_deref() {
        Some(scope) if !scope.is_empty() => format!(
            "<p>Requested scope: <code>{}</code></p>",
            escape_html(scope)
        ),
        _ => String::new(),
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Authorize {name}</title></head>
<body>
<h1>Authorize {name}</h1>
<p><strong>{name}</strong> ({id}) is requesting access to your account.</p>
{scope_line}
<form method="post" action="/authorize">
{csrf}
{client_id}
{redirect_uri}
{scope}
{state}
{code_challenge}
{code_challenge_method}
<button type="submit" name="consent_action" value="approve">Approve</button>
<button type="submit" name="consent_action" value="deny">Deny</button>
</form>
</body>
</html>
"#,
        name = escape_html(display_name),
        id = escape_html(&client.client_id),
        scope_line = scope_line,
        csrf = hidden_field("csrf_token", Some(csrf_token)),
        client_id = hidden_field("client_id", Some(&request.client_id)),
        redirect_uri = hidden_field("redirect_uri", Some(&request.redirect_uri)),
        scope = hidden_field("scope", request.scope.as_deref()),
        state = hidden_field("state", request.state.as_deref()),
        code_challenge = hidden_field("code_challenge", request.code_challenge.as_deref()),
        code_challenge_method =
            hidden_field("code_challenge_method", request.code_challenge_method.as_deref()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientEntry;
    use crate::downstream::{ReferenceIssuer, TokenBridge};
    use axum::body::Body;
    use axum::http::{Request, header::{COOKIE, SET_COOKIE}};
    use bridge_auth::provider::{ClientAuthStyle, MissingRefreshPolicy};
    use bridge_store::store::{MemoryStore, SessionStore};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    /// In-process upstream IdP: a token endpoint and a GitHub-style user
    /// endpoint, with a hit counter on /token.
    async fn mock_idp() -> (String, Arc<AtomicU64>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token_hits = Arc::new(AtomicU64::new(0));
        let hits = token_hits.clone();

        tokio::spawn(async move {
            let app = Router::new()
                .route(
                    "/token",
                    post(move || {
                        let hits = hits.clone();
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            Json(serde_json::json!({
                                "access_token": "upstream-at",
                                "token_type": "bearer",
                                "refresh_token": "upstream-rt",
                                "expires_in": 3600,
                            }))
                        }
                    }),
                )
                .route(
                    "/user",
                    get(|| async {
                        Json(serde_json::json!({
                            "id": 583231,
                            "login": "octocat",
                            "email": "octocat@example.com",
                        }))
                    }),
                );
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), token_hits)
    }

    fn test_provider(idp_base: &str) -> ProviderConfig {
        ProviderConfig {
            name: "mock-idp".into(),
            authorization_endpoint: Url::parse("https://idp.example.com/authorize").unwrap(),
            token_endpoint: Url::parse(&format!("{idp_base}/token")).unwrap(),
            userinfo_endpoint: Some(Url::parse(&format!("{idp_base}/user")).unwrap()),
            jwks_uri: None,
            issuer: None,
            client_id: "bridge-client".into(),
            client_secret: None,
            scopes: "read:user".into(),
            auth_style: ClientAuthStyle::Public,
            use_nonce: false,
            on_missing_refresh: MissingRefreshPolicy::Passthrough,
        }
    }

    async fn test_app(idp_base: &str) -> Router {
        let provider = Arc::new(test_provider(idp_base));
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let http = reqwest::Client::new();
        let bridge = Arc::new(TokenBridge::new(
            http.clone(),
            (*provider).clone(),
            Duration::from_secs(300),
        ));
        let issuer: Arc<dyn Issuer> = Arc::new(ReferenceIssuer::new(
            vec![ClientEntry {
                client_id: "mcp-client".into(),
                redirect_uris: vec!["http://localhost:3000/cb".into()],
                name: Some("Example MCP".into()),
            }],
            store.clone(),
            bridge,
        ));
        let state = AppState {
            provider,
            callback_url: Arc::new("http://bridge.test/callback".into()),
            cookie_secret: Arc::new(Secret::new("test-cookie-secret".to_string())),
            consent_ttl_secs: 3600,
            bind_txn_cookie: true,
            secure_cookies: true,
            transactions: Arc::new(TransactionManager::new(
                store,
                Duration::from_secs(600),
            )),
            issuer,
            http,
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
        };
        build_router(state, 100)
    }

    const AUTHORIZE_URI: &str = "/authorize?response_type=code&client_id=mcp-client\
        &redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb&scope=profile&state=xyz\
        &code_challenge=downstream-challenge-value&code_challenge_method=S256";

    fn set_cookie_pairs(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(|s| s.to_string())
            .collect()
    }

    fn raw_set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect()
    }

    fn cookie_value<'a>(pairs: &'a [String], name: &str) -> Option<&'a str> {
        pairs
            .iter()
            .find_map(|p| p.strip_prefix(&format!("{name}=")))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn extract_hidden(html: &str, name: &str) -> String {
        let marker = format!(r#"name="{name}" value=""#);
        let start = html.find(&marker).unwrap() + marker.len();
        let end = html[start..].find('"').unwrap();
        html[start..start + end].to_string()
    }

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    /// Drive GET /authorize + approve POST, returning the upstream
    /// redirect URL and the cookies to present at the callback.
    async fn approve_flow(app: &Router) -> (Url, String) {
        let response = app
            .clone()
            .oneshot(Request::get(AUTHORIZE_URI).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookies = set_cookie_pairs(&response);
        let csrf_cookie = cookie_value(&cookies, CSRF_COOKIE).unwrap().to_string();
        let html = body_string(response).await;
        let csrf_token = extract_hidden(&html, "csrf_token");

        let form = format!(
            "consent_action=approve&csrf_token={csrf_token}&client_id=mcp-client\
             &redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb&scope=profile&state=xyz\
             &code_challenge=downstream-challenge-value&code_challenge_method=S256"
        );
        let response = app
            .clone()
            .oneshot(
                Request::post("/authorize")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header(COOKIE, format!("{CSRF_COOKIE}={csrf_cookie}"))
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        let upstream = Url::parse(&location(&response)).unwrap();
        let post_cookies = set_cookie_pairs(&response);
        let txn_cookie = cookie_value(&post_cookies, TXN_COOKIE).unwrap().to_string();
        (upstream, format!("{TXN_COOKIE}={txn_cookie}"))
    }

    fn query_param(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    #[tokio::test]
    async fn consent_page_renders_with_csrf_field() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        let response = app
            .oneshot(Request::get(AUTHORIZE_URI).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookies = set_cookie_pairs(&response);
        let csrf_cookie = cookie_value(&cookies, CSRF_COOKIE).unwrap().to_string();

        let html = body_string(response).await;
        assert!(html.contains("Example MCP"));
        assert!(html.contains(r#"name="consent_action" value="approve""#));
        assert!(html.contains(r#"name="consent_action" value="deny""#));
        // Double-submit: hidden field matches the cookie
        assert_eq!(extract_hidden(&html, "csrf_token"), csrf_cookie);
    }

    #[tokio::test]
    async fn cookies_carry_secure_and_httponly_attributes() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        let response = app
            .clone()
            .oneshot(Request::get(AUTHORIZE_URI).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let raw = raw_set_cookies(&response);
        let csrf = raw.iter().find(|c| c.starts_with(CSRF_COOKIE)).unwrap();
        assert!(csrf.contains("Secure"));
        assert!(csrf.contains("HttpOnly"));
        assert!(csrf.contains("SameSite=Lax"));

        let pairs = set_cookie_pairs(&response);
        let csrf_cookie = cookie_value(&pairs, CSRF_COOKIE).unwrap().to_string();
        let html = body_string(response).await;
        let csrf_token = extract_hidden(&html, "csrf_token");

        let form = format!(
            "consent_action=approve&csrf_token={csrf_token}&client_id=mcp-client\
             &redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb&scope=profile&state=xyz\
             &code_challenge=downstream-challenge-value&code_challenge_method=S256"
        );
        let response = app
            .clone()
            .oneshot(
                Request::post("/authorize")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header(COOKIE, format!("{CSRF_COOKIE}={csrf_cookie}"))
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        let raw = raw_set_cookies(&response);
        for name in [CONSENT_COOKIE, TXN_COOKIE] {
            let cookie = raw.iter().find(|c| c.starts_with(name)).unwrap();
            assert!(cookie.contains("Secure"), "{name} missing Secure");
            assert!(cookie.contains("HttpOnly"), "{name} missing HttpOnly");
        }
    }

    #[tokio::test]
    async fn unknown_client_gets_rendered_error_not_redirect() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        let response = app
            .oneshot(
                Request::get(
                    "/authorize?response_type=code&client_id=intruder\
                     &redirect_uri=http%3A%2F%2Fevil.example.com%2Fcb",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn unregistered_redirect_uri_is_rejected() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        let response = app
            .oneshot(
                Request::get(
                    "/authorize?response_type=code&client_id=mcp-client\
                     &redirect_uri=http%3A%2F%2Fevil.example.com%2Fcb",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn plain_challenge_method_is_rejected() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        let response = app
            .oneshot(
                Request::get(
                    "/authorize?response_type=code&client_id=mcp-client\
                     &redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb\
                     &code_challenge=x&code_challenge_method=plain",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn approve_redirects_upstream_with_pkce_and_state() {
        let (idp, token_hits) = mock_idp().await;
        let app = test_app(&idp).await;

        let (upstream, _cookies) = approve_flow(&app).await;

        assert!(upstream.as_str().starts_with("https://idp.example.com/authorize?"));
        assert_eq!(
            query_param(&upstream, "code_challenge_method").as_deref(),
            Some("S256")
        );
        assert_eq!(
            query_param(&upstream, "redirect_uri").as_deref(),
            Some("http://bridge.test/callback")
        );
        // The upstream challenge is the bridge's own, not the client's
        let challenge = query_param(&upstream, "code_challenge").unwrap();
        assert_ne!(challenge, "downstream-challenge-value");
        // state is the opaque transaction handle
        assert_eq!(query_param(&upstream, "state").unwrap().len(), 43);
        // Approval alone must not touch the upstream token endpoint
        assert_eq!(token_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deny_redirects_downstream_without_upstream_calls() {
        let (idp, token_hits) = mock_idp().await;
        let app = test_app(&idp).await;

        let response = app
            .clone()
            .oneshot(Request::get(AUTHORIZE_URI).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let cookies = set_cookie_pairs(&response);
        let csrf_cookie = cookie_value(&cookies, CSRF_COOKIE).unwrap().to_string();
        let html = body_string(response).await;
        let csrf_token = extract_hidden(&html, "csrf_token");

        let form = format!(
            "consent_action=deny&csrf_token={csrf_token}&client_id=mcp-client\
             &redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb&state=xyz"
        );
        let response = app
            .oneshot(
                Request::post("/authorize")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header(COOKIE, format!("{CSRF_COOKIE}={csrf_cookie}"))
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let url = Url::parse(&location(&response)).unwrap();
        assert!(url.as_str().starts_with("http://localhost:3000/cb?"));
        assert_eq!(query_param(&url, "error").as_deref(), Some("access_denied"));
        assert_eq!(query_param(&url, "state").as_deref(), Some("xyz"));
        assert_eq!(token_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn consent_post_without_matching_csrf_is_rejected() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        let form = "consent_action=approve&csrf_token=forged&client_id=mcp-client\
                    &redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb";
        let response = app
            .oneshot(
                Request::post("/authorize")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header(COOKIE, format!("{CSRF_COOKIE}=something-else"))
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn callback_completes_flow_with_one_exchange() {
        let (idp, token_hits) = mock_idp().await;
        let app = test_app(&idp).await;

        let (upstream, txn_cookie) = approve_flow(&app).await;
        let handle = query_param(&upstream, "state").unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/callback?code=upstream-code&state={handle}"))
                    .header(COOKIE, &txn_cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(token_hits.load(Ordering::SeqCst), 1);

        let url = Url::parse(&location(&response)).unwrap();
        assert!(url.as_str().starts_with("http://localhost:3000/cb?"));
        assert!(query_param(&url, "code").is_some());
        assert_eq!(query_param(&url, "state").as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn callback_replay_is_rejected() {
        let (idp, token_hits) = mock_idp().await;
        let app = test_app(&idp).await;

        let (upstream, txn_cookie) = approve_flow(&app).await;
        let handle = query_param(&upstream, "state").unwrap();
        let request = || {
            Request::get(format!("/callback?code=upstream-code&state={handle}"))
                .header(COOKIE, &txn_cookie)
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::FOUND);

        let replay = app.oneshot(request()).await.unwrap();
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
        // The replay never reached the upstream token endpoint
        assert_eq!(token_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_rejected() {
        let (idp, token_hits) = mock_idp().await;
        let app = test_app(&idp).await;

        let response = app
            .oneshot(
                Request::get("/callback?code=x&state=never-issued")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(token_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_without_txn_cookie_is_rejected() {
        let (idp, token_hits) = mock_idp().await;
        let app = test_app(&idp).await;

        let (upstream, _txn_cookie) = approve_flow(&app).await;
        let handle = query_param(&upstream, "state").unwrap();

        let response = app
            .oneshot(
                Request::get(format!("/callback?code=upstream-code&state={handle}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(token_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_denial_propagates_to_downstream_client() {
        let (idp, token_hits) = mock_idp().await;
        let app = test_app(&idp).await;

        let (upstream, txn_cookie) = approve_flow(&app).await;
        let handle = query_param(&upstream, "state").unwrap();

        let response = app
            .oneshot(
                Request::get(format!(
                    "/callback?error=access_denied&error_description=user+cancelled&state={handle}"
                ))
                .header(COOKIE, &txn_cookie)
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let url = Url::parse(&location(&response)).unwrap();
        assert!(url.as_str().starts_with("http://localhost:3000/cb?"));
        assert_eq!(query_param(&url, "error").as_deref(), Some("access_denied"));
        assert_eq!(token_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn full_flow_through_downstream_token_endpoint() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        let (upstream, txn_cookie) = approve_flow(&app).await;
        let handle = query_param(&upstream, "state").unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/callback?code=upstream-code&state={handle}"))
                    .header(COOKIE, &txn_cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let url = Url::parse(&location(&response)).unwrap();
        let code = query_param(&url, "code").unwrap();

        // The downstream challenge was sent on /authorize; redeeming
        // requires a matching verifier, which this test doesn't have
        let form = format!(
            "grant_type=authorization_code&code={code}\
             &redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb&client_id=mcp-client\
             &code_verifier=wrong"
        );
        let response = app
            .clone()
            .oneshot(
                Request::post("/token")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert!(body.contains("invalid_grant"), "got: {body}");
    }

    #[tokio::test]
    async fn second_authorize_with_consent_cookie_skips_the_page() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        // First pass to earn the consent cookie
        let response = app
            .clone()
            .oneshot(Request::get(AUTHORIZE_URI).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let cookies = set_cookie_pairs(&response);
        let csrf_cookie = cookie_value(&cookies, CSRF_COOKIE).unwrap().to_string();
        let html = body_string(response).await;
        let csrf_token = extract_hidden(&html, "csrf_token");

        let form = format!(
            "consent_action=approve&csrf_token={csrf_token}&client_id=mcp-client\
             &redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcb"
        );
        let response = app
            .clone()
            .oneshot(
                Request::post("/authorize")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header(COOKIE, format!("{CSRF_COOKIE}={csrf_cookie}"))
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();
        let consent_cookie = cookie_value(&set_cookie_pairs(&response), CONSENT_COOKIE)
            .unwrap()
            .to_string();

        // Second pass: straight to the upstream redirect
        let response = app
            .oneshot(
                Request::get(AUTHORIZE_URI)
                    .header(COOKIE, format!("{CONSENT_COOKIE}={consent_cookie}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("https://idp.example.com/authorize?"));
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let (idp, _) = mock_idp().await;
        let app = test_app(&idp).await;

        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert!(body_string(health).await.contains("healthy"));

        let metrics = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
    }

    #[test]
    fn escape_html_covers_attribute_breakout() {
        assert_eq!(
            escape_html(r#""><script>alert('x')</script>"#),
            "&quot;&gt;&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt;"
        );
    }
}
