//! OAuth/OIDC protocol library for the authorization bridge
//!
//! Everything protocol-shaped lives here, with no dependency on the service
//! binary: PKCE generation/verification, the HMAC-signed consent cookie,
//! CSRF tokens, the upstream provider strategy values, token endpoint
//! access, ID-token/claims validation, and the lazy token-refresh bridge.
//!
//! Flow overview:
//! 1. The bridge opens a transaction with `pkce::generate()` and a nonce
//! 2. The user agent is redirected via `ProviderConfig::authorize_url()`
//! 3. The callback exchanges the code with `token::exchange_code()`
//! 4. `claims` validates the ID token (or fetches userinfo) and normalizes
//!    identity into `SessionProps`
//! 5. The downstream issuer later calls `refresh::on_grant()` during its
//!    code and refresh-token grants to keep both token lifetimes aligned

pub mod claims;
pub mod consent;
pub mod csrf;
pub mod error;
pub mod pkce;
pub mod props;
pub mod provider;
pub mod refresh;
pub mod token;

pub use error::{Error, Result};
pub use props::{IdentityClaims, SessionProps, TokenSet, now_millis};
pub use provider::{ClientAuthStyle, MissingRefreshPolicy, ProviderConfig};
pub use refresh::{GrantKind, GrantOutcome};
pub use token::TokenResponse;
