//! Error types for the admission-control gate.

use crate::rate_limit::Scope;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors from the shared counter store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, timed out, ...).
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store answered but the reply was not usable.
    #[error("counter store protocol error: {0}")]
    Protocol(String),
}

/// Unified error type for gated request processing.
///
/// `E` is the error type of the downstream operation being protected.
#[derive(Debug, Clone)]
pub enum GateError<E> {
    /// The hierarchical rate limiter rejected the request.
    RateLimited {
        /// Scope whose counter exceeded its threshold.
        level: Scope,
        /// Remaining time in the blocking scope's window.
        retry_after: Duration,
        /// Whether the effective threshold had been adaptively tightened.
        adaptive: bool,
    },
    /// The circuit breaker for the target service is open.
    CircuitOpen {
        /// Downstream service name.
        service: String,
        /// How long the breaker has been open.
        open_for: Duration,
    },
    /// The downstream call exceeded the per-service timeout.
    Timeout { elapsed: Duration, timeout: Duration },
    /// No breaker is registered for the requested service name.
    UnknownService { service: String },
    /// The shared counter store failed.
    Store(StoreError),
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { level, retry_after, .. } => {
                write!(f, "rate limited at {} scope (retry after {:?})", level.as_str(), retry_after)
            }
            Self::CircuitOpen { service, open_for } => {
                write!(f, "circuit breaker open for '{}' (open for {:?})", service, open_for)
            }
            Self::Timeout { elapsed, timeout } => {
                write!(f, "downstream call timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::UnknownService { service } => {
                write!(f, "no circuit breaker registered for service '{}'", service)
            }
            Self::Store(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> GateError<E> {
    /// Check if this error is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error is a circuit-open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is a downstream timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Get the inner error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Suggested client wait before retrying, if this is a rate-limit rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Rejection taxonomy of the token refresh flow.
///
/// Every variant carries a stable string code via [`RefreshError::code`]; the
/// codes are part of the client-facing contract and never change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// No refresh token was presented.
    #[error("refresh token missing from request")]
    MissingRefreshToken,
    /// The token failed decoding or signature verification, or is not a
    /// refresh token.
    #[error("refresh token malformed or failed verification")]
    MalformedRefreshToken,
    /// The token verified but its validity window has passed.
    #[error("refresh token expired")]
    RefreshTokenExpired,
    /// The embedded session is missing, inactive, owned by another user, or
    /// idle past the session timeout.
    #[error("session is missing, inactive, or timed out")]
    InvalidSession,
    /// The rolling hourly refresh-attempt limit was exceeded.
    #[error("refresh attempts exceeded the rolling hourly limit")]
    RateLimitExceeded,
    /// The token was already consumed: a replay. All sessions for the user
    /// are revoked when this is returned.
    #[error("refresh token reuse detected; all sessions for the user were revoked")]
    SecurityViolation,
    /// Catch-all for unexpected internal failure (store outage, etc.).
    #[error("internal error while processing refresh: {0}")]
    RefreshProcessingError(String),
}

impl RefreshError {
    /// Stable, client-facing error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingRefreshToken => "MISSING_REFRESH_TOKEN",
            Self::MalformedRefreshToken => "MALFORMED_REFRESH_TOKEN",
            Self::RefreshTokenExpired => "REFRESH_TOKEN_EXPIRED",
            Self::InvalidSession => "INVALID_SESSION",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::RefreshProcessingError(_) => "REFRESH_PROCESSING_ERROR",
        }
    }

    /// Whether this rejection must also be recorded as a security incident.
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation)
    }
}

impl From<StoreError> for RefreshError {
    fn from(e: StoreError) -> Self {
        Self::RefreshProcessingError(e.to_string())
    }
}
