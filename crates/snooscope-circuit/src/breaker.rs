use crate::config::CircuitBreakerConfig;
use crate::events::CircuitEvent;
use snooscope_core::ScrapeError;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A limited number of probe calls are allowed through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of a breaker, for status surfaces and the engine's
/// error-budget check.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// How long the endpoint has been unhealthy (open or probing), if it
    /// is.
    pub open_duration: Option<Duration>,
}

struct Core {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_probes: u32,
    /// When the circuit last left Closed; cleared on re-close.
    unhealthy_since: Option<Instant>,
    /// When the circuit entered Open, for cool-down expiry.
    opened_at: Option<Instant>,
}

struct Inner {
    core: Mutex<Core>,
    config: CircuitBreakerConfig,
}

/// Per-endpoint failure isolation. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    pub(crate) fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    half_open_successes: 0,
                    half_open_probes: 0,
                    unhealthy_since: None,
                    opened_at: None,
                }),
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.core.lock().unwrap().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let core = self.inner.core.lock().unwrap();
        CircuitSnapshot {
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            open_duration: core.unhealthy_since.map(|t| t.elapsed()),
        }
    }

    /// How long the endpoint has been unhealthy, if it is.
    pub fn open_duration(&self) -> Option<Duration> {
        self.inner
            .core
            .lock()
            .unwrap()
            .unhealthy_since
            .map(|t| t.elapsed())
    }

    /// Admits or rejects a call. Open circuits flip to half-open once the
    /// cool-down has passed; half-open circuits admit a bounded number of
    /// probes.
    pub fn try_acquire(&self) -> Result<(), ScrapeError> {
        let mut core = self.inner.core.lock().unwrap();
        match core.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = core
                    .opened_at
                    .map(|t| t.elapsed() >= self.inner.config.cool_down)
                    .unwrap_or(true);
                if cooled {
                    self.transition(&mut core, CircuitState::HalfOpen);
                    core.half_open_probes += 1;
                    Ok(())
                } else {
                    drop(core);
                    self.reject()
                }
            }
            CircuitState::HalfOpen => {
                if core.half_open_probes < self.inner.config.success_threshold {
                    core.half_open_probes += 1;
                    Ok(())
                } else {
                    drop(core);
                    self.reject()
                }
            }
        }
    }

    fn reject(&self) -> Result<(), ScrapeError> {
        self.inner
            .config
            .event_listeners
            .emit(&CircuitEvent::CallRejected {
                name: self.inner.config.name.clone(),
                timestamp: Instant::now(),
            });
        #[cfg(feature = "metrics")]
        metrics::counter!("circuit_rejected_total", "circuit" => self.inner.config.name.clone())
            .increment(1);
        Err(ScrapeError::CircuitOpen {
            endpoint: self.inner.config.name.clone(),
        })
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut core = self.inner.core.lock().unwrap();
        core.consecutive_failures = 0;
        if core.state == CircuitState::HalfOpen {
            core.half_open_successes += 1;
            if core.half_open_successes >= self.inner.config.success_threshold {
                self.transition(&mut core, CircuitState::Closed);
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut core = self.inner.core.lock().unwrap();
        core.consecutive_failures += 1;
        self.inner
            .config
            .event_listeners
            .emit(&CircuitEvent::FailureRecorded {
                name: self.inner.config.name.clone(),
                timestamp: Instant::now(),
                consecutive_failures: core.consecutive_failures,
            });
        match core.state {
            CircuitState::HalfOpen => self.transition(&mut core, CircuitState::Open),
            CircuitState::Closed
                if core.consecutive_failures >= self.inner.config.failure_threshold =>
            {
                self.transition(&mut core, CircuitState::Open)
            }
            _ => {}
        }
    }

    /// Runs `fut` under the breaker: fails fast while open, then records
    /// the outcome. Errors the classifier rules out (permanent,
    /// cancelled, skipped) pass through without counting against the
    /// endpoint.
    pub async fn call<F, T>(&self, fut: F) -> Result<T, ScrapeError>
    where
        F: Future<Output = Result<T, ScrapeError>>,
    {
        self.try_acquire()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if (self.inner.config.classifier)(&err) {
                    self.record_failure();
                } else if !err.is_cancelled() {
                    // a permanent answer still proves the endpoint is up
                    self.record_success();
                }
                Err(err)
            }
        }
    }

    fn transition(&self, core: &mut Core, to: CircuitState) {
        if core.state == to {
            return;
        }
        let from = core.state;
        core.state = to;
        match to {
            CircuitState::Open => {
                core.opened_at = Some(Instant::now());
                if core.unhealthy_since.is_none() {
                    core.unhealthy_since = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                core.half_open_successes = 0;
                core.half_open_probes = 0;
            }
            CircuitState::Closed => {
                core.consecutive_failures = 0;
                core.half_open_successes = 0;
                core.half_open_probes = 0;
                core.opened_at = None;
                core.unhealthy_since = None;
            }
        }
        self.inner
            .config
            .event_listeners
            .emit(&CircuitEvent::StateTransition {
                name: self.inner.config.name.clone(),
                timestamp: Instant::now(),
                from,
                to,
            });
        #[cfg(feature = "tracing")]
        tracing::info!(
            circuit = %self.inner.config.name,
            from = from.as_str(),
            to = to.as_str(),
            "circuit state transition"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "circuit_transitions_total",
            "circuit" => self.inner.config.name.clone(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(cool_down: Duration) -> CircuitBreaker {
        CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .success_threshold(2)
            .cool_down(cool_down)
            .name("test")
            .build()
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let b = breaker(Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let b = breaker(Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn open_rejects_without_touching_the_endpoint() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..3 {
            b.record_failure();
        }
        let err = b.try_acquire().unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(b.try_acquire().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().is_ok());
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.try_acquire().is_ok());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_bounds_concurrent_probes() {
        let b = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.try_acquire().is_ok());
        assert!(b.try_acquire().is_ok());
        // probe budget exhausted until results come back
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test]
    async fn call_counts_transient_not_permanent() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..5 {
            let _ = b
                .call(async { Err::<(), _>(ScrapeError::permanent("private sub")) })
                .await;
        }
        assert_eq!(b.state(), CircuitState::Closed);

        for _ in 0..3 {
            let _ = b
                .call(async { Err::<(), _>(ScrapeError::transient("timeout")) })
                .await;
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_the_future() {
        let calls = Arc::new(AtomicUsize::new(0));
        let b = breaker(Duration::from_secs(30));
        for _ in 0..3 {
            b.record_failure();
        }
        let c = Arc::clone(&calls);
        let result = b
            .call(async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok::<_, ScrapeError>(())
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unhealthy_duration_spans_reopen_cycles() {
        let b = breaker(Duration::from_millis(10));
        assert!(b.open_duration().is_none());
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(b.open_duration().is_some());
    }

    #[test]
    fn transition_listener_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let b = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .on_state_transition(move |_, _| {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .build();
        b.record_failure();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
