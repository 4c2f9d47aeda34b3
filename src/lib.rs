#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Portcullis
//!
//! Resilience and admission control for multi-tenant API gateways:
//! hierarchical rate limiting, per-service circuit breaking, and a session
//! and token-refresh authority with replay protection.
//!
//! ## Features
//!
//! - **Hierarchical rate limiting** across five nested scopes (global,
//!   tenant, user, endpoint, client IP) with per-traffic-class policies
//! - **Circuit breakers** with sliding-window failure/slow-call rates and
//!   half-open recovery, one per downstream service
//! - **Token refresh authority** with atomic single-use consumption; a
//!   replayed refresh token revokes every session of the affected user
//! - **Adaptive tightening** of non-global thresholds under load
//! - **Tower middleware** so the gate drops in front of any service stack
//!
//! ## Quick Start
//!
//! ```rust
//! use portcullis::{
//!     BreakerRegistry, Gate, HierarchicalRateLimiter, InMemoryCounterStore,
//!     RateLimitContext, UnavailablePolicy,
//! };
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = HierarchicalRateLimiter::new(
//!         Arc::new(InMemoryCounterStore::new()),
//!         UnavailablePolicy::FailOpen,
//!     );
//!     let breakers = Arc::new(BreakerRegistry::standard().unwrap());
//!     let gate = Gate::new(limiter, breakers);
//!
//!     let ctx = RateLimitContext::new(
//!         IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
//!         "/api/documents",
//!     )
//!     .with_user("user-1");
//!
//!     let admission = gate.admit(&ctx, "req-1").await;
//!     assert!(admission.is_admitted());
//! }
//! ```

pub mod audit;
pub mod circuit_breaker;
pub mod clock;
pub mod context;
pub mod error;
pub mod gate;
pub mod rate_limit;
pub mod refresh;
pub mod session;
pub mod store;
pub mod token;

// Re-exports
pub use audit::{AuditEvent, AuditKind, AuditSink, MemoryAuditSink, SecurityIncident, TracingAuditSink};
pub use circuit_breaker::{
    BreakerEvent, BreakerRegistry, CallOutcome, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitState, FallbackResponse, TimeoutAs,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use context::{is_exempt, RateLimitContext, RequestType};
pub use error::{GateError, RefreshError, StoreError};
pub use gate::middleware::{AdmissionLayer, AdmissionService};
pub use gate::{refresh_status, Admission, Gate, RefreshErrorBody, RejectionBody};
pub use rate_limit::{
    HierarchicalRateLimiter, PolicyError, RateLimitPolicy, RateLimitResult, Scope, ScopeCounts,
    ScopePolicy, UnavailablePolicy,
};
pub use refresh::{RefreshConfig, RefreshRequest, TokenAuthority};
pub use session::{
    InMemorySessionStore, SessionRecord, SessionState, SessionStore, MAX_CONCURRENT_SESSIONS,
};
pub use store::{CounterStore, InMemoryCounterStore, WindowCount};
pub use token::{TokenClaims, TokenCodec, TokenError, TokenKind, TokenPair, UnsignedCodec};
