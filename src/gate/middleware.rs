//! Tower middleware wrapping admission control around any inner service.

use crate::context::RateLimitContext;
use crate::error::GateError;
use crate::gate::{Admission, Gate};
use crate::rate_limit::Scope;
use crate::store::CounterStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that gates requests through a [`Gate`].
///
/// The extractor maps the transport's request type to a
/// [`RateLimitContext`]; the middleware stays agnostic of the HTTP framework
/// in use.
pub struct AdmissionLayer<S, F> {
    gate: Arc<Gate<S>>,
    extractor: Arc<F>,
}

impl<S, F> AdmissionLayer<S, F> {
    pub fn new(gate: Arc<Gate<S>>, extractor: F) -> Self {
        Self { gate, extractor: Arc::new(extractor) }
    }
}

impl<S, F> Clone for AdmissionLayer<S, F> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone(), extractor: self.extractor.clone() }
    }
}

impl<Srv, S, F> Layer<Srv> for AdmissionLayer<S, F> {
    type Service = AdmissionService<Srv, S, F>;

    fn layer(&self, service: Srv) -> Self::Service {
        AdmissionService {
            inner: service,
            gate: self.gate.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<Srv, S, F> {
    inner: Srv,
    gate: Arc<Gate<S>>,
    extractor: Arc<F>,
}

impl<Srv: Clone, S, F> Clone for AdmissionService<Srv, S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: self.gate.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<Srv, S, F, Req> Service<Req> for AdmissionService<Srv, S, F>
where
    Srv: Service<Req> + Clone + Send + 'static,
    Srv::Future: Send + 'static,
    Srv::Error: Send + 'static,
    Srv::Response: Send + 'static,
    S: CounterStore + 'static,
    F: Fn(&Req) -> RateLimitContext + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Srv::Response;
    type Error = GateError<Srv::Error>;
    // Boxed future keeps the middleware object-safe across inner services.
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let ctx = (self.extractor)(&req);
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let request_id = uuid::Uuid::new_v4().to_string();
            match gate.admit(&ctx, &request_id).await {
                Admission::Exempt | Admission::Granted(_) => {
                    inner.call(req).await.map_err(GateError::Inner)
                }
                Admission::Rejected { result, .. } => Err(GateError::RateLimited {
                    level: result.blocked_level().unwrap_or(Scope::Global),
                    retry_after: result.retry_after(),
                    adaptive: result.adaptively_limited(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerRegistry;
    use crate::context::RequestType;
    use crate::rate_limit::{
        HierarchicalRateLimiter, RateLimitPolicy, ScopePolicy, UnavailablePolicy,
    };
    use crate::store::InMemoryCounterStore;
    use std::convert::Infallible;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    fn gate() -> Arc<Gate<InMemoryCounterStore>> {
        let limiter = HierarchicalRateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            UnavailablePolicy::FailClosed,
        )
        .with_policy(
            RequestType::ApiGeneral,
            RateLimitPolicy {
                ip: ScopePolicy::new(2, Duration::from_secs(60)),
                ..RateLimitPolicy::for_request_type(RequestType::ApiGeneral)
            },
        )
        .unwrap();
        Arc::new(Gate::new(limiter, Arc::new(BreakerRegistry::new())))
    }

    fn extract(path: &String) -> RateLimitContext {
        RateLimitContext::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), path)
    }

    #[tokio::test]
    async fn admitted_requests_reach_the_inner_service() {
        let layer = AdmissionLayer::new(gate(), extract);
        let mut service = ServiceBuilder::new()
            .layer(layer)
            .service(service_fn(|req: String| async move {
                Ok::<_, Infallible>(format!("handled {req}"))
            }));

        let response = service
            .ready()
            .await
            .unwrap()
            .call("/api/documents".to_string())
            .await
            .unwrap();
        assert_eq!(response, "handled /api/documents");
    }

    #[tokio::test]
    async fn over_limit_requests_never_reach_the_inner_service() {
        let layer = AdmissionLayer::new(gate(), extract);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_seen = calls.clone();
        let mut service =
            ServiceBuilder::new().layer(layer).service(service_fn(move |req: String| {
                let calls = calls_seen.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, Infallible>(req)
                }
            }));

        for _ in 0..2 {
            service
                .ready()
                .await
                .unwrap()
                .call("/api/documents".to_string())
                .await
                .unwrap();
        }
        let err = service
            .ready()
            .await
            .unwrap()
            .call("/api/documents".to_string())
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        let wait = err.retry_after().unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(60));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exempt_paths_pass_straight_through() {
        let layer = AdmissionLayer::new(gate(), extract);
        let mut service = ServiceBuilder::new()
            .layer(layer)
            .service(service_fn(|req: String| async move { Ok::<_, Infallible>(req) }));

        for _ in 0..10 {
            let response =
                service.ready().await.unwrap().call("/health".to_string()).await.unwrap();
            assert_eq!(response, "/health");
        }
    }
}
