//! Token claims and encoding.
//!
//! Every refresh token carries a unique `token_id`; that id is what the
//! replay detector marks as consumed. Signature schemes are deployment
//! policy, so the codec is a trait: [`UnsignedCodec`] is the embedded
//! default (base64url over JSON), a production deployment plugs in its
//! JWT/HMAC implementation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// What a token grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Short-lived bearer credential presented on API requests.
    Access,
    /// Single-use credential exchanged for a new token pair.
    Refresh,
}

/// Claims embedded in every issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Unique per-token id; the unit of replay detection for refresh tokens.
    pub token_id: Uuid,
    /// Session this token is bound to.
    pub session_id: Uuid,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub kind: TokenKind,
    pub expires_at_millis: u64,
}

impl TokenClaims {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at_millis
    }
}

/// Why a presented token could not be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed or failed verification")]
    Malformed,
    #[error("token has expired")]
    Expired,
}

/// Encodes claims to wire form and verifies presented tokens.
pub trait TokenCodec: Send + Sync {
    /// Serialize claims into a token string.
    fn issue(&self, claims: &TokenClaims) -> String;

    /// Decode and verify a presented token. Expiry is checked here so
    /// callers cannot forget it.
    fn verify(&self, token: &str, now_millis: u64) -> Result<TokenClaims, TokenError>;
}

/// Default codec: base64url-encoded JSON claims, no signature.
///
/// Suitable when tokens never leave a trusted boundary (tests, embedded
/// single-process deployments). Anything internet-facing wants a signing
/// codec instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedCodec;

impl TokenCodec for UnsignedCodec {
    fn issue(&self, claims: &TokenClaims) -> String {
        use base64::Engine as _;
        let json = serde_json::to_vec(claims).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    fn verify(&self, token: &str, now_millis: u64) -> Result<TokenClaims, TokenError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims =
            serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)?;
        if claims.is_expired(now_millis) {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

/// Freshly issued access + refresh token pair, serialized in the refresh
/// response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
    pub token_type: &'static str,
}

impl TokenPair {
    pub fn new(access_token: String, refresh_token: String, access_ttl: Duration) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_in: access_ttl.as_secs(),
            token_type: "Bearer",
        }
    }
}
