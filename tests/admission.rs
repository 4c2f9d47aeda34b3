//! End-to-end admission pipeline: limiter, gate, breakers, middleware.

use async_trait::async_trait;
use portcullis::{
    Admission, BreakerRegistry, CounterStore, Gate, GateError, HierarchicalRateLimiter,
    InMemoryCounterStore, RateLimitContext, RateLimitPolicy, RequestType, Scope, ScopePolicy,
    StoreError, UnavailablePolicy, WindowCount,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

fn ctx(path: &str) -> RateLimitContext {
    RateLimitContext::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)), path)
        .with_user("user-1")
        .with_tenant("tenant-1")
}

fn gate_with_user_limit(threshold: u64) -> Gate<InMemoryCounterStore> {
    let limiter = HierarchicalRateLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        UnavailablePolicy::FailClosed,
    )
    .with_policy(
        RequestType::ApiGeneral,
        RateLimitPolicy {
            user: ScopePolicy::new(threshold, MINUTE),
            ..RateLimitPolicy::for_request_type(RequestType::ApiGeneral)
        },
    )
    .unwrap();
    Gate::new(limiter, Arc::new(BreakerRegistry::standard().unwrap()))
}

#[tokio::test]
async fn hundredth_request_admitted_hundred_first_rejected() {
    let gate = gate_with_user_limit(100);
    let c = ctx("/api/documents");

    for i in 1..=100 {
        let admission = gate.admit(&c, "req").await;
        assert!(admission.is_admitted(), "request {i} should pass");
    }

    let admission = gate.admit(&c, "req-101").await;
    let Admission::Rejected { result, body } = admission else {
        panic!("101st request should be rejected");
    };
    assert_eq!(result.blocked_level(), Some(Scope::User));
    assert_eq!(body.level, Scope::User);
    assert!(body.retry_after >= 1 && body.retry_after <= 60);
    assert_eq!(body.error, "RATE_LIMIT_EXCEEDED");
    assert_eq!(body.limits.user, Some(101));
}

#[tokio::test]
async fn rejections_keep_consuming_quota() {
    let gate = gate_with_user_limit(1);
    let c = ctx("/api/documents");

    assert!(gate.admit(&c, "r1").await.is_admitted());
    for expected in 2..=5u64 {
        match gate.admit(&c, "r").await {
            Admission::Rejected { result, .. } => {
                assert_eq!(result.counts().user, Some(expected));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn exempt_paths_never_touch_counters() {
    let gate = gate_with_user_limit(1);
    for path in ["/health", "/ready", "/metrics", "/static/logo.svg"] {
        for _ in 0..5 {
            assert!(matches!(gate.admit(&ctx(path), "r").await, Admission::Exempt));
        }
    }
    // All quota is still available afterwards.
    assert!(gate.admit(&ctx("/api/documents"), "r").await.is_admitted());
}

#[tokio::test]
async fn granted_responses_carry_per_scope_headers() {
    let gate = gate_with_user_limit(100);
    let admission = gate.admit(&ctx("/api/documents"), "r").await;
    let headers = admission.headers();
    for name in
        ["X-RateLimit-Global", "X-RateLimit-Tenant", "X-RateLimit-User", "X-RateLimit-IP"]
    {
        assert!(headers.iter().any(|(k, v)| *k == name && v == "1"), "missing {name}");
    }
    assert!(!headers.iter().any(|(k, _)| *k == "Retry-After"));
}

#[derive(Debug)]
struct DownStore;

#[async_trait]
impl CounterStore for DownStore {
    async fn incr_with_ttl(&self, _: &str, _: Duration) -> Result<WindowCount, StoreError> {
        Err(StoreError::Unavailable("backend offline".into()))
    }

    async fn set_if_absent(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("backend offline".into()))
    }

    async fn compare_and_swap(&self, _: &str, _: u64, _: u64) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("backend offline".into()))
    }
}

#[tokio::test]
async fn store_outage_follows_the_configured_policy() {
    let open = Gate::new(
        HierarchicalRateLimiter::new(Arc::new(DownStore), UnavailablePolicy::FailOpen),
        Arc::new(BreakerRegistry::new()),
    );
    assert!(open.admit(&ctx("/api/documents"), "r").await.is_admitted());

    let closed = Gate::new(
        HierarchicalRateLimiter::new(Arc::new(DownStore), UnavailablePolicy::FailClosed),
        Arc::new(BreakerRegistry::new()),
    );
    assert!(!closed.admit(&ctx("/api/documents"), "r").await.is_admitted());
}

#[tokio::test]
async fn tripped_breaker_short_circuits_and_offers_fallback() {
    let gate = gate_with_user_limit(1_000);

    // The auth profile trips at 50% failures over a minimum of 5 calls.
    for _ in 0..5 {
        let result: Result<u32, GateError<std::io::Error>> = gate
            .forward("auth", || async {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "downstream boom"))
            })
            .await;
        assert!(result.unwrap_err().as_inner().is_some());
    }

    let rejected: Result<u32, GateError<std::io::Error>> =
        gate.forward("auth", || async { Ok(1) }).await;
    assert!(rejected.unwrap_err().is_circuit_open());

    let fallback = gate.fallback_for("auth").unwrap();
    assert_eq!(fallback.status, 503);
    assert_eq!(fallback.body["error"], "SERVICE_UNAVAILABLE");
}

#[tokio::test]
async fn adaptive_tightening_never_touches_the_global_scope() {
    let store = Arc::new(InMemoryCounterStore::new());
    let limiter = HierarchicalRateLimiter::new(store, UnavailablePolicy::FailClosed)
        .with_policy(
            RequestType::ApiGeneral,
            RateLimitPolicy {
                global: ScopePolicy::new(50, MINUTE),
                user: ScopePolicy::new(10, MINUTE),
                ..RateLimitPolicy::for_request_type(RequestType::ApiGeneral)
            },
        )
        .unwrap();
    limiter.set_load_factor(0.1); // user effective threshold: 1

    // Requests from distinct users exercise the global counter well past the
    // tightened value (0.1 * 50 = 5) without being blocked there.
    for i in 0..10 {
        let c = RateLimitContext::new(
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, i as u8 + 1)),
            "/api/documents",
        )
        .with_user(format!("tenant-user-{i}"));
        let result = limiter.check(&c).await;
        assert!(result.admitted(), "global ceiling must not be tightened");
    }

    // A single user hits the tightened ceiling immediately.
    let c = RateLimitContext::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 99)), "/api/documents")
        .with_user("solo-user");
    assert!(limiter.check(&c).await.admitted());
    let second = limiter.check(&c).await;
    assert!(!second.admitted());
    assert_eq!(second.blocked_level(), Some(Scope::User));
    assert!(second.adaptively_limited());
}
