//! Hierarchical rate limiting.
//!
//! Admission is decided by independent counters at five nested scopes —
//! global, tenant, user, endpoint, client IP — each with its own window and
//! threshold per [`RequestType`]. Scopes are evaluated in a fixed order and
//! every evaluated scope is incremented exactly once, whether or not the
//! request is ultimately admitted; rejected requests still count against
//! quota so limit probing cannot escape accounting.
//!
//! The limiter owns no state of its own: all counters live in the shared
//! [`CounterStore`], which keeps the decision correct across gateway
//! replicas.

use crate::context::{RateLimitContext, RequestType};
use crate::store::CounterStore;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The five nested admission scopes, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Tenant,
    User,
    Endpoint,
    Ip,
}

impl Scope {
    /// Evaluation order is fixed and deterministic.
    pub const ORDER: [Scope; 5] =
        [Scope::Global, Scope::Tenant, Scope::User, Scope::Endpoint, Scope::Ip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Tenant => "tenant",
            Self::User => "user",
            Self::Endpoint => "endpoint",
            Self::Ip => "ip",
        }
    }

    /// Response header carrying this scope's current count.
    pub fn header_name(&self) -> &'static str {
        match self {
            Self::Global => "X-RateLimit-Global",
            Self::Tenant => "X-RateLimit-Tenant",
            Self::User => "X-RateLimit-User",
            Self::Endpoint => "X-RateLimit-Endpoint",
            Self::Ip => "X-RateLimit-IP",
        }
    }
}

/// Threshold and window for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopePolicy {
    /// Maximum admitted requests per window. The request bringing the count
    /// to exactly `threshold` is still admitted.
    pub threshold: u64,
    /// Fixed window length.
    pub window: Duration,
}

impl ScopePolicy {
    pub const fn new(threshold: u64, window: Duration) -> Self {
        Self { threshold, window }
    }
}

/// Per-request-type thresholds for the five scopes.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub global: ScopePolicy,
    pub tenant: ScopePolicy,
    pub user: ScopePolicy,
    pub endpoint: ScopePolicy,
    pub ip: ScopePolicy,
}

const MINUTE: Duration = Duration::from_secs(60);

impl RateLimitPolicy {
    /// Hand-tuned defaults per traffic class. Authentication and token
    /// refresh carry much tighter ceilings than general API traffic.
    pub fn for_request_type(request_type: RequestType) -> Self {
        match request_type {
            RequestType::Authentication => Self {
                global: ScopePolicy::new(1_000, MINUTE),
                tenant: ScopePolicy::new(200, MINUTE),
                user: ScopePolicy::new(20, MINUTE),
                endpoint: ScopePolicy::new(500, MINUTE),
                ip: ScopePolicy::new(30, MINUTE),
            },
            RequestType::TokenRefresh => Self {
                global: ScopePolicy::new(500, MINUTE),
                tenant: ScopePolicy::new(100, MINUTE),
                user: ScopePolicy::new(10, MINUTE),
                endpoint: ScopePolicy::new(250, MINUTE),
                ip: ScopePolicy::new(20, MINUTE),
            },
            RequestType::ApiUpload => Self {
                global: ScopePolicy::new(2_000, MINUTE),
                tenant: ScopePolicy::new(500, MINUTE),
                user: ScopePolicy::new(60, MINUTE),
                endpoint: ScopePolicy::new(1_000, MINUTE),
                ip: ScopePolicy::new(120, MINUTE),
            },
            RequestType::ApiSearch => Self {
                global: ScopePolicy::new(5_000, MINUTE),
                tenant: ScopePolicy::new(1_000, MINUTE),
                user: ScopePolicy::new(120, MINUTE),
                endpoint: ScopePolicy::new(2_500, MINUTE),
                ip: ScopePolicy::new(240, MINUTE),
            },
            RequestType::AdminOperations => Self {
                global: ScopePolicy::new(300, MINUTE),
                tenant: ScopePolicy::new(60, MINUTE),
                user: ScopePolicy::new(30, MINUTE),
                endpoint: ScopePolicy::new(150, MINUTE),
                ip: ScopePolicy::new(60, MINUTE),
            },
            RequestType::ApiGeneral => Self {
                global: ScopePolicy::new(10_000, MINUTE),
                tenant: ScopePolicy::new(2_000, MINUTE),
                user: ScopePolicy::new(100, MINUTE),
                endpoint: ScopePolicy::new(5_000, MINUTE),
                ip: ScopePolicy::new(300, MINUTE),
            },
        }
    }

    fn scope(&self, scope: Scope) -> ScopePolicy {
        match scope {
            Scope::Global => self.global,
            Scope::Tenant => self.tenant,
            Scope::User => self.user,
            Scope::Endpoint => self.endpoint,
            Scope::Ip => self.ip,
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        for scope in Scope::ORDER {
            let p = self.scope(scope);
            if p.threshold == 0 {
                return Err(PolicyError::ZeroThreshold { scope });
            }
            if p.window.is_zero() {
                return Err(PolicyError::ZeroWindow { scope });
            }
        }
        Ok(())
    }
}

/// Errors produced when validating limiter policies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("threshold for {} scope must be > 0", .scope.as_str())]
    ZeroThreshold { scope: Scope },
    #[error("window for {} scope must be > 0", .scope.as_str())]
    ZeroWindow { scope: Scope },
}

/// Behavior when the shared counter store is unreachable.
///
/// Whichever policy is configured is applied uniformly to the whole decision
/// and logged; the limiter never crashes on a store outage and never applies
/// different policies to different scopes of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailablePolicy {
    /// Admit everything while the store is down.
    FailOpen,
    /// Reject everything while the store is down.
    FailClosed,
}

/// Post-increment counts per evaluated scope. Scopes skipped because the
/// identity was absent (no tenant/user) or never reached stay `None`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeCounts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<u64>,
}

impl ScopeCounts {
    fn set(&mut self, scope: Scope, count: u64) {
        match scope {
            Scope::Global => self.global = Some(count),
            Scope::Tenant => self.tenant = Some(count),
            Scope::User => self.user = Some(count),
            Scope::Endpoint => self.endpoint = Some(count),
            Scope::Ip => self.ip = Some(count),
        }
    }

    fn get(&self, scope: Scope) -> Option<u64> {
        match scope {
            Scope::Global => self.global,
            Scope::Tenant => self.tenant,
            Scope::User => self.user,
            Scope::Endpoint => self.endpoint,
            Scope::Ip => self.ip,
        }
    }
}

/// Outcome of one hierarchical check. Produced fresh per request, never
/// persisted.
///
/// Fields are private so the invariant "`blocked_level` is present if and
/// only if the request was rejected" holds by construction.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    counts: ScopeCounts,
    admitted: bool,
    blocked_level: Option<Scope>,
    retry_after: Duration,
    adaptively_limited: bool,
}

impl RateLimitResult {
    fn admit(counts: ScopeCounts, adaptive: bool) -> Self {
        Self {
            counts,
            admitted: true,
            blocked_level: None,
            retry_after: Duration::ZERO,
            adaptively_limited: adaptive,
        }
    }

    fn reject(counts: ScopeCounts, scope: Scope, retry_after: Duration, adaptive: bool) -> Self {
        Self {
            counts,
            admitted: false,
            blocked_level: Some(scope),
            retry_after,
            adaptively_limited: adaptive,
        }
    }

    pub fn admitted(&self) -> bool {
        self.admitted
    }

    /// Scope that caused rejection; `None` exactly when admitted.
    pub fn blocked_level(&self) -> Option<Scope> {
        self.blocked_level
    }

    /// Remaining time in the blocking scope's window. Zero when admitted.
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    /// Whether adaptive tightening influenced the thresholds of this decision.
    pub fn adaptively_limited(&self) -> bool {
        self.adaptively_limited
    }

    pub fn counts(&self) -> &ScopeCounts {
        &self.counts
    }

    /// `Retry-After` value in whole seconds, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs().max(1)
    }

    /// Render the telemetry headers carried on every gated response:
    /// per-scope counts, the adaptive marker, and on rejection the blocking
    /// level plus `Retry-After`.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(8);
        for scope in Scope::ORDER {
            if let Some(count) = self.counts.get(scope) {
                headers.push((scope.header_name(), count.to_string()));
            }
        }
        if self.adaptively_limited {
            headers.push(("X-RateLimit-Adaptive", "true".to_string()));
        }
        if let Some(level) = self.blocked_level {
            headers.push(("X-RateLimit-Level", level.as_str().to_string()));
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }
        headers
    }
}

/// Multi-scope admission controller backed by a shared [`CounterStore`].
pub struct HierarchicalRateLimiter<S> {
    store: Arc<S>,
    policies: HashMap<RequestType, RateLimitPolicy>,
    unavailable: UnavailablePolicy,
    /// Tightening factor in (0, 1]; written by the load monitor, read on
    /// every check without locking.
    load_factor: ArcSwap<f64>,
}

const ALL_REQUEST_TYPES: [RequestType; 6] = [
    RequestType::Authentication,
    RequestType::ApiUpload,
    RequestType::ApiSearch,
    RequestType::AdminOperations,
    RequestType::TokenRefresh,
    RequestType::ApiGeneral,
];

impl<S: CounterStore> HierarchicalRateLimiter<S> {
    /// Build a limiter with the default per-type policy table.
    pub fn new(store: Arc<S>, unavailable: UnavailablePolicy) -> Self {
        let policies = ALL_REQUEST_TYPES
            .into_iter()
            .map(|rt| (rt, RateLimitPolicy::for_request_type(rt)))
            .collect();
        Self { store, policies, unavailable, load_factor: ArcSwap::from_pointee(1.0) }
    }

    /// Replace the policy for one traffic class, validating it.
    pub fn with_policy(
        mut self,
        request_type: RequestType,
        policy: RateLimitPolicy,
    ) -> Result<Self, PolicyError> {
        policy.validate()?;
        self.policies.insert(request_type, policy);
        Ok(self)
    }

    /// Set the adaptive tightening factor. Values are clamped to (0, 1];
    /// `1.0` disables tightening. The load signal driving this is up to the
    /// caller (e.g., sustained global counts near the ceiling).
    pub fn set_load_factor(&self, factor: f64) {
        let clamped = if factor.is_finite() { factor.clamp(0.01, 1.0) } else { 1.0 };
        self.load_factor.store(Arc::new(clamped));
        if clamped < 1.0 {
            tracing::info!(factor = clamped, "adaptive rate limiting engaged");
        }
    }

    /// Evaluate the five scopes in order for `ctx`.
    ///
    /// Every evaluated scope's counter is incremented exactly once; the first
    /// scope whose post-increment count exceeds its effective threshold stops
    /// evaluation and is reported as the blocking level. Store failures are
    /// resolved by the configured [`UnavailablePolicy`], applied to the whole
    /// decision.
    pub async fn check(&self, ctx: &RateLimitContext) -> RateLimitResult {
        let policy = self
            .policies
            .get(&ctx.request_type)
            .cloned()
            .unwrap_or_else(|| RateLimitPolicy::for_request_type(ctx.request_type));
        let factor = **self.load_factor.load();
        let tightened = factor < 1.0;

        let mut counts = ScopeCounts::default();
        let mut adaptive_applied = false;

        for scope in Scope::ORDER {
            let Some(id) = scope_id(ctx, scope) else { continue };
            let scope_policy = policy.scope(scope);

            // The global ceiling is the load signal itself and is never
            // tightened; all narrower scopes are.
            let effective = if tightened && scope != Scope::Global {
                adaptive_applied = true;
                (((scope_policy.threshold as f64) * factor).ceil() as u64).max(1)
            } else {
                scope_policy.threshold
            };

            let key = format!("rl:{}:{}:{}", ctx.request_type.as_str(), scope.as_str(), id);
            match self.store.incr_with_ttl(&key, scope_policy.window).await {
                Ok(window) => {
                    counts.set(scope, window.count);
                    if window.count > effective {
                        tracing::debug!(
                            scope = scope.as_str(),
                            count = window.count,
                            threshold = effective,
                            request_type = ctx.request_type.as_str(),
                            "request rejected by rate limiter"
                        );
                        return RateLimitResult::reject(
                            counts,
                            scope,
                            window.resets_in,
                            adaptive_applied,
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        scope = scope.as_str(),
                        policy = ?self.unavailable,
                        "counter store unreachable during rate-limit check"
                    );
                    return match self.unavailable {
                        UnavailablePolicy::FailOpen => {
                            RateLimitResult::admit(counts, adaptive_applied)
                        }
                        UnavailablePolicy::FailClosed => RateLimitResult::reject(
                            counts,
                            scope,
                            scope_policy.window,
                            adaptive_applied,
                        ),
                    };
                }
            }
        }

        RateLimitResult::admit(counts, adaptive_applied)
    }
}

/// Store-key identity for a scope, or `None` when the scope does not apply
/// to this request (anonymous user, no tenant).
fn scope_id(ctx: &RateLimitContext, scope: Scope) -> Option<String> {
    match scope {
        Scope::Global => Some("all".to_string()),
        Scope::Tenant => ctx.tenant_id.clone(),
        Scope::User => ctx.user_id.clone(),
        Scope::Endpoint => Some(ctx.endpoint.clone()),
        Scope::Ip => Some(ctx.client_ip.to_string()),
    }
}
