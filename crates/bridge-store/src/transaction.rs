//! Single-use authorization transactions
//!
//! A transaction is created the moment a user approves consent and
//! captures everything the callback will need: the downstream client's
//! original authorization request, the PKCE verifier for the upstream
//! exchange, and the OIDC nonce. Its handle doubles as the upstream
//! `state` parameter, which is what makes the handle itself the CSRF
//! defense on the callback — only the browser that was redirected
//! upstream carries it.
//!
//! Handles are consumed atomically: the first callback wins, every later
//! attempt (replay, double-click, back button) sees `InvalidState`. The
//! error never says which of unknown/expired/replayed happened.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bridge_auth::pkce;
use bridge_auth::props::now_millis;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::SessionStore;

/// The downstream client's authorization request, held verbatim so the
/// callback can complete it after the upstream round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// The downstream client's own PKCE challenge, verified by the issuer
    /// at its token endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
}

/// Everything parked between consent approval and the upstream callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub request: AuthorizationRequest,
    /// Verifier for the bridge's own upstream PKCE pair
    pub code_verifier: String,
    pub nonce: String,
    pub created_at: u64,
}

/// Handle plus the values that go into the upstream authorize URL.
#[derive(Debug, Clone)]
pub struct OpenedTransaction {
    pub handle: String,
    pub code_challenge: String,
    pub nonce: String,
}

/// Creates and consumes transactions on top of a `SessionStore`.
pub struct TransactionManager {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

fn storage_key(handle: &str) -> String {
    format!("txn:{handle}")
}

/// 32 random bytes as URL-safe base64, 43 characters.
fn new_handle() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl TransactionManager {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Open a transaction for an approved authorization request.
    ///
    /// Generates the handle, the upstream PKCE pair, and the nonce, and
    /// stores the transaction under the TTL. The verifier never leaves
    /// the store until `consume`.
    pub async fn open(&self, request: AuthorizationRequest) -> Result<OpenedTransaction> {
        let handle = new_handle();
        let upstream_pkce = pkce::generate();
        let nonce = new_handle();

        let transaction = Transaction {
            request,
            code_verifier: upstream_pkce.verifier,
            nonce: nonce.clone(),
            created_at: now_millis(),
        };
        let json = serde_json::to_string(&transaction)
            .map_err(|e| Error::Serialize(e.to_string()))?;

        self.store
            .put(&storage_key(&handle), json, Some(self.ttl))
            .await?;
        debug!(client_id = %transaction.request.client_id, "transaction opened");

        Ok(OpenedTransaction {
            handle,
            code_challenge: upstream_pkce.challenge,
            nonce,
        })
    }

    /// Consume a transaction by handle, atomically.
    ///
    /// Unknown, expired, and already-consumed handles all collapse into
    /// `InvalidState`.
    pub async fn consume(&self, handle: &str) -> Result<Transaction> {
        let json = self
            .store
            .take(&storage_key(handle))
            .await?
            .ok_or(Error::InvalidState)?;

        serde_json::from_str(&json).map_err(|e| Error::Serialize(e.to_string()))
    }
}
