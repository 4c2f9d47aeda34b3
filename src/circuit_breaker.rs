//! Per-service circuit breaking.
//!
//! Each downstream service gets a three-state breaker driven by a sliding
//! window of recent call outcomes (success / failure / slow). State words are
//! atomics and every transition is a compare-exchange, so concurrent callers
//! agree on a single lifecycle; the outcome window itself sits behind a short
//! critical section.
//!
//! Breaker state is process-local: replicas trip independently on their own
//! observations of the downstream service. See DESIGN.md for the consistency
//! trade-off.

use crate::clock::{Clock, MonotonicClock};
use crate::error::GateError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode; outcomes are recorded into the window.
    Closed,
    /// Short-circuits calls until the open-state wait elapses.
    Open,
    /// Probe mode allowing a limited number of trial calls.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> CircuitState {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Classification of one downstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Completed successfully but slower than the configured threshold.
    Slow,
}

/// How a per-call timeout is recorded in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAs {
    Failure,
    Slow,
}

/// Deterministic response returned in place of a downstream call while the
/// breaker is open.
#[derive(Debug, Clone)]
pub struct FallbackResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl FallbackResponse {
    fn unavailable(service: &str) -> Self {
        Self {
            status: 503,
            body: serde_json::json!({
                "error": "SERVICE_UNAVAILABLE",
                "message": format!("{service} is temporarily unavailable"),
                "service": service,
            }),
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CircuitBreakerError {
    #[error("rate thresholds must be in (0, 100] (got {provided})")]
    InvalidRateThreshold { provided: f32 },
    #[error("sliding window size must be > 0")]
    InvalidWindowSize,
    #[error("minimum_calls must be in 1..=window_size (got {provided})")]
    InvalidMinimumCalls { provided: usize },
    #[error("wait duration in open state must be > 0")]
    InvalidWaitDuration,
    #[error("half_open_permits must be in 1..=window_size (got {provided})")]
    InvalidHalfOpenPermits { provided: usize },
    #[error("per-call timeout must be > 0")]
    InvalidCallTimeout,
    #[error("circuit breaker for service '{service}' already registered")]
    AlreadyRegistered { service: String },
}

/// Validated per-service breaker configuration.
///
/// Critical services (authentication, admin) use small windows and fast
/// detection; expensive services with naturally high latency (embedding,
/// retrieval) use larger windows and longer waits so false trips stay rare.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_rate_threshold: f32,
    slow_rate_threshold: f32,
    slow_call_duration: Duration,
    window_size: usize,
    minimum_calls: usize,
    wait_in_open: Duration,
    half_open_permits: usize,
    call_timeout: Duration,
    timeout_as: TimeoutAs,
    fallback: FallbackResponse,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: &str,
        failure_rate_threshold: f32,
        slow_rate_threshold: f32,
        slow_call_duration: Duration,
        window_size: usize,
        minimum_calls: usize,
        wait_in_open: Duration,
        half_open_permits: usize,
        call_timeout: Duration,
        timeout_as: TimeoutAs,
    ) -> Result<Self, CircuitBreakerError> {
        let cfg = Self {
            failure_rate_threshold,
            slow_rate_threshold,
            slow_call_duration,
            window_size,
            minimum_calls,
            wait_in_open,
            half_open_permits,
            call_timeout,
            timeout_as,
            fallback: FallbackResponse::unavailable(service),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Replace the fallback payload returned while the breaker is open.
    pub fn with_fallback(mut self, fallback: FallbackResponse) -> Self {
        self.fallback = fallback;
        self
    }

    fn validate(&self) -> Result<(), CircuitBreakerError> {
        for rate in [self.failure_rate_threshold, self.slow_rate_threshold] {
            if !(rate > 0.0 && rate <= 100.0) {
                return Err(CircuitBreakerError::InvalidRateThreshold { provided: rate });
            }
        }
        if self.window_size == 0 {
            return Err(CircuitBreakerError::InvalidWindowSize);
        }
        if self.minimum_calls == 0 || self.minimum_calls > self.window_size {
            return Err(CircuitBreakerError::InvalidMinimumCalls {
                provided: self.minimum_calls,
            });
        }
        if self.wait_in_open.is_zero() {
            return Err(CircuitBreakerError::InvalidWaitDuration);
        }
        if self.half_open_permits == 0 || self.half_open_permits > self.window_size {
            return Err(CircuitBreakerError::InvalidHalfOpenPermits {
                provided: self.half_open_permits,
            });
        }
        if self.call_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidCallTimeout);
        }
        Ok(())
    }

    /// Authentication service: small window, fast trip, fast recovery probes.
    pub fn auth() -> Self {
        Self::profile(
            "auth", 50.0, 50.0, 2, 10, 5, 10, 2, 3, TimeoutAs::Failure,
        )
    }

    /// Document service: mid-size window, uploads tolerate some latency.
    pub fn document() -> Self {
        Self::profile(
            "document", 50.0, 60.0, 5, 20, 10, 30, 3, 10, TimeoutAs::Slow,
        )
    }

    /// Embedding / retrieval service: high normal latency, large window,
    /// long waits; a false trip here is expensive.
    pub fn embedding() -> Self {
        Self::profile(
            "embedding", 60.0, 70.0, 15, 50, 20, 60, 5, 30, TimeoutAs::Slow,
        )
    }

    /// Core API service.
    pub fn core_api() -> Self {
        Self::profile(
            "core", 50.0, 60.0, 3, 20, 10, 20, 3, 5, TimeoutAs::Failure,
        )
    }

    /// Admin service: trips earlier than anything else.
    pub fn admin() -> Self {
        Self::profile(
            "admin", 40.0, 50.0, 2, 10, 5, 15, 2, 3, TimeoutAs::Failure,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn profile(
        service: &str,
        failure_rate: f32,
        slow_rate: f32,
        slow_secs: u64,
        window: usize,
        min_calls: usize,
        wait_secs: u64,
        permits: usize,
        timeout_secs: u64,
        timeout_as: TimeoutAs,
    ) -> Self {
        // Profile values are compile-time constants; validation cannot fail.
        Self::new(
            service,
            failure_rate,
            slow_rate,
            Duration::from_secs(slow_secs),
            window,
            min_calls,
            Duration::from_secs(wait_secs),
            permits,
            Duration::from_secs(timeout_secs),
            timeout_as,
        )
        .unwrap_or_else(|e| panic!("built-in profile invalid: {e}"))
    }

    pub fn failure_rate_threshold(&self) -> f32 {
        self.failure_rate_threshold
    }

    pub fn slow_rate_threshold(&self) -> f32 {
        self.slow_rate_threshold
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn wait_in_open(&self) -> Duration {
        self.wait_in_open
    }

    pub fn fallback(&self) -> &FallbackResponse {
        &self.fallback
    }
}

/// Emitted on every state transition; consumed by health reporting and
/// metrics.
#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub service: String,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Failure rate observed in the window at transition time (percent).
    pub failure_rate: f32,
}

#[derive(Debug)]
struct OutcomeWindow {
    buf: VecDeque<CallOutcome>,
    capacity: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self { buf: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, outcome: CallOutcome) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(outcome);
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn clear(&mut self) {
        self.buf.clear();
    }

    fn rate_of(&self, wanted: CallOutcome) -> f32 {
        if self.buf.is_empty() {
            return 0.0;
        }
        let hits = self.buf.iter().filter(|o| **o == wanted).count();
        (hits as f32 / self.buf.len() as f32) * 100.0
    }

    fn failure_rate(&self) -> f32 {
        self.rate_of(CallOutcome::Failure)
    }

    fn slow_rate(&self) -> f32 {
        self.rate_of(CallOutcome::Slow)
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: AtomicU8,
    opened_at_millis: AtomicU64,
    half_open_in_flight: AtomicUsize,
    rejected_calls: AtomicU64,
    window: Mutex<OutcomeWindow>,
}

/// Circuit breaker guarding async calls to one downstream service.
///
/// Clones share the same underlying state via `Arc`, so all handles observe
/// and affect the same circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    service: String,
    core: Arc<BreakerCore>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    /// Create a breaker for `service`, validating the config.
    pub fn new(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            service: service.into(),
            core: Arc::new(BreakerCore {
                state: AtomicU8::new(STATE_CLOSED),
                opened_at_millis: AtomicU64::new(0),
                half_open_in_flight: AtomicUsize::new(0),
                rejected_calls: AtomicU64::new(0),
                window: Mutex::new(OutcomeWindow::new(config.window_size)),
            }),
            config: Arc::new(config),
            clock: Arc::new(MonotonicClock::default()),
            events,
        })
    }

    /// Override the clock (useful for deterministic recovery tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current breaker state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    /// Calls rejected without touching the downstream service.
    pub fn rejected_calls(&self) -> u64 {
        self.core.rejected_calls.load(Ordering::Relaxed)
    }

    /// Subscribe to state-transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    fn use_events(&mut self, sender: broadcast::Sender<BreakerEvent>) {
        self.events = sender;
    }

    /// Execute `operation` under breaker protection.
    ///
    /// - **Closed**: runs the call; its outcome (success / failure / slow /
    ///   timeout) is recorded into the sliding window, and the breaker trips
    ///   when failure or slow rates exceed their thresholds once
    ///   `minimum_calls` outcomes exist.
    /// - **Open**: rejects with `GateError::CircuitOpen` without invoking
    ///   `operation`; after the wait elapses, the first caller moves the
    ///   breaker to half-open.
    /// - **HalfOpen**: admits up to `half_open_permits` trial calls; their
    ///   aggregate rates decide whether the breaker closes or reopens.
    ///
    /// Every call races the per-service timeout; a timeout is recorded as a
    /// failure or slow outcome per config, never silently dropped.
    pub async fn call<T, E, Fut, Op>(&self, operation: Op) -> Result<T, GateError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        struct TrialGuard<'a> {
            core: &'a BreakerCore,
            active: bool,
        }
        impl Drop for TrialGuard<'_> {
            fn drop(&mut self) {
                if self.active {
                    self.core.half_open_in_flight.fetch_sub(1, Ordering::Release);
                }
            }
        }
        let mut guard: Option<TrialGuard<'_>> = None;

        loop {
            match self.state() {
                CircuitState::Open => {
                    let opened_at = self.core.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.wait_in_open.as_millis() as u64 {
                        self.core.rejected_calls.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            service = %self.service,
                            open_for_ms = elapsed,
                            "call rejected: circuit open"
                        );
                        return Err(GateError::CircuitOpen {
                            service: self.service.clone(),
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                    match self.core.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // We won the race; acquire a trial permit like
                            // any other half-open caller.
                            self.lock_window().clear();
                            self.emit(CircuitState::Open, CircuitState::HalfOpen, 0.0);
                            tracing::info!(service = %self.service, "circuit breaker half-open");
                            continue;
                        }
                        Err(STATE_CLOSED) => break,
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    let current = self.core.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_permits {
                        self.core.half_open_in_flight.fetch_sub(1, Ordering::Release);
                        self.core.rejected_calls.fetch_add(1, Ordering::Relaxed);
                        let opened_at = self.core.opened_at_millis.load(Ordering::Acquire);
                        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                        return Err(GateError::CircuitOpen {
                            service: self.service.clone(),
                            open_for: Duration::from_millis(elapsed),
                        });
                    }
                    guard = Some(TrialGuard { core: &self.core, active: true });
                    tracing::debug!(
                        service = %self.service,
                        in_flight = current + 1,
                        max = self.config.half_open_permits,
                        "circuit breaker: half-open trial call"
                    );
                    break;
                }
                CircuitState::Closed => break,
            }
        }

        let trial = guard.is_some();
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.call_timeout, operation()).await;
        let elapsed = started.elapsed();
        drop(guard);

        let (outcome, mapped) = match result {
            Ok(Ok(value)) => {
                let outcome = if elapsed > self.config.slow_call_duration {
                    CallOutcome::Slow
                } else {
                    CallOutcome::Success
                };
                (outcome, Ok(value))
            }
            Ok(Err(e)) => (CallOutcome::Failure, Err(GateError::Inner(e))),
            Err(_) => {
                let outcome = match self.config.timeout_as {
                    TimeoutAs::Failure => CallOutcome::Failure,
                    TimeoutAs::Slow => CallOutcome::Slow,
                };
                (
                    outcome,
                    Err(GateError::Timeout { elapsed, timeout: self.config.call_timeout }),
                )
            }
        };

        self.record(outcome, trial);
        mapped
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, OutcomeWindow> {
        self.core.window.lock().expect("breaker window mutex poisoned")
    }

    fn record(&self, outcome: CallOutcome, trial: bool) {
        match self.state() {
            CircuitState::Closed => {
                let mut window = self.lock_window();
                window.push(outcome);
                if window.len() < self.config.minimum_calls {
                    return;
                }
                let failure_rate = window.failure_rate();
                let slow_rate = window.slow_rate();
                if (failure_rate >= self.config.failure_rate_threshold
                    || slow_rate >= self.config.slow_rate_threshold)
                    && self
                        .core
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.core
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    drop(window);
                    self.emit(CircuitState::Closed, CircuitState::Open, failure_rate);
                    tracing::error!(
                        service = %self.service,
                        failure_rate,
                        slow_rate,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Only trial calls vote on recovery; a call admitted while
                // closed that completes after the transition is stale.
                if !trial {
                    return;
                }
                let mut window = self.lock_window();
                window.push(outcome);
                if window.len() < self.config.half_open_permits {
                    return;
                }
                let failure_rate = window.failure_rate();
                let slow_rate = window.slow_rate();
                let recovered = failure_rate < self.config.failure_rate_threshold
                    && slow_rate < self.config.slow_rate_threshold;
                if recovered
                    && self
                        .core
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    window.clear();
                    self.core.opened_at_millis.store(0, Ordering::Release);
                    drop(window);
                    self.emit(CircuitState::HalfOpen, CircuitState::Closed, failure_rate);
                    tracing::info!(service = %self.service, "circuit breaker closed");
                } else if !recovered && self
                    .core
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    window.clear();
                    self.core
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    drop(window);
                    self.emit(CircuitState::HalfOpen, CircuitState::Open, failure_rate);
                    tracing::warn!(
                        service = %self.service,
                        failure_rate,
                        slow_rate,
                        "circuit breaker reopened: trial calls failed"
                    );
                }
            }
            // A call that outlived a reopen; its outcome no longer matters.
            CircuitState::Open => {}
        }
    }

    fn emit(&self, from: CircuitState, to: CircuitState, failure_rate: f32) {
        let _ = self.events.send(BreakerEvent {
            service: self.service.clone(),
            from,
            to,
            failure_rate,
        });
    }
}

/// One breaker per downstream service name.
///
/// The registry is the only way breakers are shared across the gate; it
/// refuses duplicate registrations, so at most one breaker exists per name.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: RwLock<std::collections::HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<BreakerEvent>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(128);
        Self { breakers: RwLock::new(std::collections::HashMap::new()), events }
    }

    /// Registry pre-populated with the five standard service profiles.
    pub fn standard() -> Result<Self, CircuitBreakerError> {
        let registry = Self::new();
        registry.register("auth", CircuitBreakerConfig::auth())?;
        registry.register("document", CircuitBreakerConfig::document())?;
        registry.register("embedding", CircuitBreakerConfig::embedding())?;
        registry.register("core", CircuitBreakerConfig::core_api())?;
        registry.register("admin", CircuitBreakerConfig::admin())?;
        Ok(registry)
    }

    /// Build and register a breaker for `service`. Errors if the config is
    /// invalid or the service already has a breaker.
    pub fn register(
        &self,
        service: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), CircuitBreakerError> {
        let breaker = CircuitBreaker::new(service, config)?;
        self.register_breaker(breaker)
    }

    /// Register a prebuilt breaker (e.g., one with a custom clock). The
    /// breaker is rewired onto the registry's shared event channel.
    pub fn register_breaker(&self, mut breaker: CircuitBreaker) -> Result<(), CircuitBreakerError> {
        breaker.use_events(self.events.clone());
        let mut map = self.breakers.write().expect("breaker registry poisoned");
        if map.contains_key(breaker.service()) {
            return Err(CircuitBreakerError::AlreadyRegistered {
                service: breaker.service().to_string(),
            });
        }
        map.insert(breaker.service().to_string(), Arc::new(breaker));
        Ok(())
    }

    /// Get the breaker for `service`.
    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.breakers.read().expect("breaker registry poisoned");
        map.get(service).cloned()
    }

    /// Subscribe to transition events from every registered breaker.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Snapshot breaker states sorted by service name, for health reporting.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.read().expect("breaker registry poisoned");
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn test_config() -> CircuitBreakerConfig {
        // Window 10, minimum 5, 50% thresholds, 10s wait, 2 trial permits.
        CircuitBreakerConfig::new(
            "test",
            50.0,
            50.0,
            Duration::from_secs(5),
            10,
            5,
            Duration::from_secs(10),
            2,
            Duration::from_secs(5),
            TimeoutAs::Failure,
        )
        .unwrap()
    }

    fn breaker_with_clock(clock: ManualClock) -> CircuitBreaker {
        CircuitBreaker::new("test", test_config()).unwrap().with_clock(clock)
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, GateError<TestError>> {
        breaker.call(|| async { Ok::<_, TestError>(42) }).await
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<u32, GateError<TestError>> {
        breaker.call(|| async { Err::<u32, _>(TestError("boom")) }).await
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let err = CircuitBreakerConfig::new(
            "x", 0.0, 50.0, Duration::from_secs(1), 10, 5,
            Duration::from_secs(1), 1, Duration::from_secs(1), TimeoutAs::Failure,
        )
        .unwrap_err();
        assert!(matches!(err, CircuitBreakerError::InvalidRateThreshold { .. }));

        let err = CircuitBreakerConfig::new(
            "x", 50.0, 50.0, Duration::from_secs(1), 10, 11,
            Duration::from_secs(1), 1, Duration::from_secs(1), TimeoutAs::Failure,
        )
        .unwrap_err();
        assert!(matches!(err, CircuitBreakerError::InvalidMinimumCalls { provided: 11 }));

        let err = CircuitBreakerConfig::new(
            "x", 50.0, 50.0, Duration::from_secs(1), 10, 5,
            Duration::ZERO, 1, Duration::from_secs(1), TimeoutAs::Failure,
        )
        .unwrap_err();
        assert!(matches!(err, CircuitBreakerError::InvalidWaitDuration));
    }

    #[tokio::test]
    async fn starts_closed_and_passes_calls() {
        let breaker = CircuitBreaker::new("test", test_config()).unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn trips_open_at_failure_rate_after_minimum_calls() {
        let breaker = CircuitBreaker::new("test", test_config()).unwrap();
        let invocations = Arc::new(AtomicUsize::new(0));

        // 5 calls, 3 failures: 60% >= 50% threshold with minimum met.
        for outcome_fails in [true, false, true, false, true] {
            let invocations = invocations.clone();
            let _ = breaker
                .call(|| {
                    let invocations = invocations.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        if outcome_fails {
                            Err(TestError("boom"))
                        } else {
                            Ok(1u32)
                        }
                    }
                })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(invocations.load(Ordering::SeqCst), 5);

        // 6th call is rejected without invoking the operation.
        let result = breaker
            .call(|| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(1u32)
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(invocations.load(Ordering::SeqCst), 5, "downstream untouched while open");
        assert_eq!(breaker.rejected_calls(), 1);
    }

    #[tokio::test]
    async fn does_not_trip_below_minimum_calls() {
        let breaker = CircuitBreaker::new("test", test_config()).unwrap();
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed, "4 < minimum_calls");
    }

    #[tokio::test]
    async fn recovers_through_half_open_after_wait() {
        let clock = ManualClock::new();
        let breaker = breaker_with_clock(clock.clone());

        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Still inside the wait: rejected.
        clock.advance(9_999);
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());

        // Wait elapsed: two successful trials close the circuit and reset
        // the window.
        clock.advance(1);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Window was reset: a single failure must not re-trip.
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_trials_reopen_the_circuit() {
        let clock = ManualClock::new();
        let breaker = breaker_with_clock(clock.clone());

        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(10_000);

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // The wait timer restarted at reopen.
        clock.advance(5_000);
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn stale_closed_call_does_not_vote_on_recovery() {
        let clock = ManualClock::new();
        let breaker = breaker_with_clock(clock.clone());

        // A slow call admitted while closed; it completes mid-recovery.
        let stale = {
            let b = breaker.clone();
            tokio::spawn(async move {
                b.call(|| async {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Err::<u32, _>(TestError("late failure"))
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        clock.advance(10_000);

        // First trial succeeds; the breaker stays half-open awaiting a
        // second verdict.
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // The stale failure lands now and must not count as a trial.
        let _ = stale.await.expect("join error");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_trials() {
        let clock = ManualClock::new();
        let breaker = breaker_with_clock(clock.clone());

        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(10_000);

        let mut handles = vec![];
        for _ in 0..5 {
            let b = breaker.clone();
            handles.push(tokio::spawn(async move {
                b.call(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, TestError>(1u32)
                })
                .await
            }));
        }
        let results = futures::future::join_all(handles).await;
        let successes =
            results.iter().filter(|r| r.as_ref().expect("join error").is_ok()).count();
        let rejections = results
            .iter()
            .filter(|r| {
                r.as_ref()
                    .expect("join error")
                    .as_ref()
                    .err()
                    .is_some_and(|e| e.is_circuit_open())
            })
            .count();
        assert_eq!(successes, 2, "only half_open_permits trials run");
        assert_eq!(rejections, 3);
    }

    #[tokio::test]
    async fn timeout_counts_as_configured_outcome() {
        let config = CircuitBreakerConfig::new(
            "slowpoke",
            50.0,
            50.0,
            Duration::from_millis(10),
            10,
            2,
            Duration::from_secs(10),
            1,
            Duration::from_millis(20),
            TimeoutAs::Failure,
        )
        .unwrap();
        let breaker = CircuitBreaker::new("slowpoke", config).unwrap();

        for _ in 0..2 {
            let result = breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, TestError>(1u32)
                })
                .await;
            assert!(result.unwrap_err().is_timeout());
        }
        assert_eq!(breaker.state(), CircuitState::Open, "timeouts recorded as failures");
    }

    #[tokio::test]
    async fn slow_successes_trip_the_slow_rate() {
        let config = CircuitBreakerConfig::new(
            "latent",
            90.0,
            50.0,
            Duration::from_millis(5),
            10,
            2,
            Duration::from_secs(10),
            1,
            Duration::from_secs(5),
            TimeoutAs::Slow,
        )
        .unwrap();
        let breaker = CircuitBreaker::new("latent", config).unwrap();

        for _ in 0..2 {
            let result = breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, TestError>(1u32)
                })
                .await;
            assert!(result.is_ok(), "slow calls still succeed for the caller");
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn transitions_emit_events() {
        let breaker = CircuitBreaker::new("test", test_config()).unwrap();
        let mut events = breaker.subscribe();

        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        let event = events.try_recv().expect("transition event");
        assert_eq!(event.service, "test");
        assert_eq!(event.from, CircuitState::Closed);
        assert_eq!(event.to, CircuitState::Open);
        assert!(event.failure_rate >= 50.0);
    }

    #[tokio::test]
    async fn registry_enforces_one_breaker_per_service() {
        let registry = BreakerRegistry::standard().unwrap();
        assert!(registry.get("auth").is_some());
        assert!(registry.get("embedding").is_some());
        assert!(registry.get("missing").is_none());

        let err = registry.register("auth", CircuitBreakerConfig::auth()).unwrap_err();
        assert!(matches!(err, CircuitBreakerError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn registry_snapshot_reflects_breaker_states() {
        let registry = BreakerRegistry::new();
        registry.register("test", test_config()).unwrap();
        let breaker = registry.get("test").unwrap();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        let snapshot = registry.snapshot();
        assert_eq!(snapshot, vec![("test".to_string(), CircuitState::Open)]);
    }

    #[tokio::test]
    async fn registry_events_cover_all_breakers() {
        let registry = BreakerRegistry::new();
        let mut events = registry.subscribe();
        registry.register("test", test_config()).unwrap();
        let breaker = registry.get("test").unwrap();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        let event = events.try_recv().expect("transition event via registry channel");
        assert_eq!(event.service, "test");
    }
}
