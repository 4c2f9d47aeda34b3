//! The admission gate: rate limiting and circuit breaking composed into one
//! request pipeline, plus the client-facing rejection payloads.

pub mod middleware;

use crate::circuit_breaker::{BreakerRegistry, FallbackResponse};
use crate::clock::{Clock, SystemClock};
use crate::context::RateLimitContext;
use crate::error::{GateError, RefreshError};
use crate::rate_limit::{HierarchicalRateLimiter, RateLimitResult, Scope, ScopeCounts};
use crate::store::CounterStore;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

/// Body of a 429 response, serialized as JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: &'static str,
    pub message: String,
    /// Scope that blocked the request.
    pub level: Scope,
    /// Seconds the client should wait before retrying.
    pub retry_after: u64,
    pub timestamp: u64,
    pub request_id: String,
    pub limits: ScopeCounts,
}

/// Body of a refresh-flow error response (401 / 429 / 503).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshErrorBody {
    pub error: &'static str,
    pub message: String,
    pub timestamp: u64,
    pub request_id: String,
}

impl RefreshErrorBody {
    pub fn new(error: &RefreshError, request_id: &str, timestamp: u64) -> Self {
        Self {
            error: error.code(),
            message: error.to_string(),
            timestamp,
            request_id: request_id.to_string(),
        }
    }
}

/// HTTP status for a refresh rejection.
pub fn refresh_status(error: &RefreshError) -> u16 {
    match error {
        RefreshError::RateLimitExceeded => 429,
        RefreshError::RefreshProcessingError(_) => 503,
        _ => 401,
    }
}

/// Outcome of admission for one request.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Health/static path: bypasses the limiter, counters untouched.
    Exempt,
    /// Admitted; carries per-scope counts for response headers.
    Granted(RateLimitResult),
    /// Rejected; carries the 429 body and the telemetry headers.
    Rejected { result: RateLimitResult, body: RejectionBody },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }

    /// Telemetry headers for the response, when a limiter decision was made.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Admission::Exempt => Vec::new(),
            Admission::Granted(result) => result.headers(),
            Admission::Rejected { result, .. } => result.headers(),
        }
    }
}

/// Composes the hierarchical limiter and the per-service breaker registry.
///
/// The gate sits in front of routing: [`Gate::admit`] decides whether a
/// request may proceed at all, and [`Gate::forward`] wraps the downstream
/// call for the resolved service in its circuit breaker.
pub struct Gate<S> {
    limiter: HierarchicalRateLimiter<S>,
    breakers: Arc<BreakerRegistry>,
    clock: Arc<dyn Clock>,
}

impl<S: CounterStore> Gate<S> {
    pub fn new(limiter: HierarchicalRateLimiter<S>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { limiter, breakers, clock: Arc::new(SystemClock) }
    }

    /// Override the wall clock used for response timestamps.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn limiter(&self) -> &HierarchicalRateLimiter<S> {
        &self.limiter
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Run the admission decision for one request.
    pub async fn admit(&self, ctx: &RateLimitContext, request_id: &str) -> Admission {
        if ctx.is_exempt() {
            return Admission::Exempt;
        }
        let result = self.limiter.check(ctx).await;
        if result.admitted() {
            return Admission::Granted(result);
        }
        let level = result.blocked_level().unwrap_or(Scope::Global);
        let body = RejectionBody {
            error: "RATE_LIMIT_EXCEEDED",
            message: format!("rate limit exceeded at {} scope", level.as_str()),
            level,
            retry_after: result.retry_after_secs(),
            timestamp: self.clock.now_millis(),
            request_id: request_id.to_string(),
            limits: result.counts().clone(),
        };
        Admission::Rejected { result, body }
    }

    /// Execute a downstream call under the named service's circuit breaker.
    pub async fn forward<T, E, Fut, Op>(
        &self,
        service: &str,
        operation: Op,
    ) -> Result<T, GateError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let breaker = self
            .breakers
            .get(service)
            .ok_or_else(|| GateError::UnknownService { service: service.to_string() })?;
        breaker.call(operation).await
    }

    /// Deterministic substitute response for a service whose breaker is open.
    pub fn fallback_for(&self, service: &str) -> Option<FallbackResponse> {
        self.breakers.get(service).map(|b| b.config().fallback().clone())
    }

    /// Headers attached to every refresh-flow response. Token material must
    /// never be cached by intermediaries.
    pub fn refresh_response_headers(request_id: &str) -> Vec<(&'static str, String)> {
        vec![
            ("Cache-Control", "no-store".to_string()),
            ("Pragma", "no-cache".to_string()),
            ("X-Request-ID", request_id.to_string()),
        ]
    }
}
