//! Token exchange/refresh bridge
//!
//! Invoked by the downstream issuer during its own token grants to keep
//! the upstream and downstream notions of "still valid" aligned:
//!
//! - authorization_code grant: the downstream access-token TTL is pinned
//!   to the upstream token's remaining lifetime when one was declared.
//! - refresh_token grant: refresh is lazy and buffer-triggered. While the
//!   upstream token has more than `buffer` of life left, the props pass
//!   through with zero upstream calls; inside the buffer, exactly one
//!   upstream refresh runs and the new tokens are merged in.
//!
//! There is no background refresh timer — staleness is only ever checked
//! when the downstream client itself shows up with a grant.

use std::time::Duration;

use tracing::{debug, warn};

use crate::claims;
use crate::error::{Error, Result};
use crate::props::{SessionProps, expires_at_from, now_millis};
use crate::provider::{MissingRefreshPolicy, ProviderConfig};
use crate::token;

/// Which downstream grant triggered the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    AuthorizationCode,
    RefreshToken,
}

/// Result handed back to the downstream issuer.
#[derive(Debug, Clone)]
pub struct GrantOutcome {
    pub props: SessionProps,
    /// Downstream access-token TTL; None means "use the issuer default"
    pub access_token_ttl: Option<Duration>,
    pub refresh_token_ttl: Option<Duration>,
}

/// Run the bridge for one downstream grant.
pub async fn on_grant(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    grant: GrantKind,
    props: SessionProps,
    buffer: Duration,
) -> Result<GrantOutcome> {
    match grant {
        GrantKind::AuthorizationCode => Ok(align_lifetimes(props)),
        GrantKind::RefreshToken => refresh_if_needed(client, cfg, props, buffer).await,
    }
}

/// authorization_code: no upstream call, just lifetime alignment.
fn align_lifetimes(props: SessionProps) -> GrantOutcome {
    let now = now_millis();
    let access_token_ttl = props
        .tokens
        .remaining_millis(now)
        .map(Duration::from_millis);
    let refresh_token_ttl = props
        .tokens
        .refresh_expires_at
        .map(|e| Duration::from_millis(e.saturating_sub(now)));
    GrantOutcome {
        props,
        access_token_ttl,
        refresh_token_ttl,
    }
}

async fn refresh_if_needed(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    mut props: SessionProps,
    buffer: Duration,
) -> Result<GrantOutcome> {
    let Some(refresh_token) = props.tokens.refresh_token.clone() else {
        return match cfg.on_missing_refresh {
            MissingRefreshPolicy::Passthrough => {
                debug!(provider = %cfg.name, "no upstream refresh token, passing props through");
                Ok(align_lifetimes(props))
            }
            MissingRefreshPolicy::Reject => Err(Error::InvalidGrant(
                "session has no upstream refresh token".into(),
            )),
        };
    };

    let now = now_millis();
    match props.tokens.remaining_millis(now) {
        // No declared expiry: nothing to synchronize against
        None => return Ok(align_lifetimes(props)),
        Some(remaining) if remaining > buffer.as_millis() as u64 => {
            debug!(
                provider = %cfg.name,
                remaining_secs = remaining / 1000,
                "upstream token outside refresh buffer, passing through"
            );
            return Ok(align_lifetimes(props));
        }
        Some(_) => {}
    }

    debug!(provider = %cfg.name, "upstream token inside refresh buffer, refreshing");
    let response = token::refresh(client, cfg, &refresh_token).await?;

    let now = now_millis();
    props.tokens.access_token = response.access_token;
    // Providers that don't rotate refresh tokens omit the field; keep the
    // old one so the next refresh still works
    if let Some(new_refresh) = response.refresh_token {
        props.tokens.refresh_token = Some(new_refresh);
    }
    props.tokens.expires_at = response.expires_in.map(|s| expires_at_from(now, s));
    if let Some(s) = response.refresh_token_expires_in {
        props.tokens.refresh_expires_at = Some(expires_at_from(now, s));
    }

    if let Some(id_token) = response.id_token {
        revalidate_claims(client, cfg, &mut props, &id_token).await?;
        props.tokens.id_token = Some(id_token);
    }

    Ok(align_lifetimes(props))
}

/// A refresh that returns a fresh ID token gets its claims re-validated
/// (signature, issuer, audience — no nonce exists at refresh time).
async fn revalidate_claims(
    client: &reqwest::Client,
    cfg: &ProviderConfig,
    props: &mut SessionProps,
    id_token: &str,
) -> Result<()> {
    let Some(jwks_uri) = &cfg.jwks_uri else {
        warn!(provider = %cfg.name, "refresh returned id_token but no jwks_uri configured, skipping re-validation");
        return Ok(());
    };
    let jwks = claims::fetch_jwks(client, jwks_uri).await?;
    let validated = claims::validate_id_token(
        id_token,
        &jwks,
        cfg.issuer.as_deref(),
        &cfg.client_id,
        None,
    )?;
    props.claims = validated.identity();
    Ok(())
}
