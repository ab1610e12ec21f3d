use crate::breaker::{CircuitBreaker, CircuitState};
use crate::events::CircuitEvent;
use snooscope_core::events::{EventListeners, FnListener};
use snooscope_core::ScrapeError;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether an error counts against the endpoint.
///
/// Permanent errors (a private or deleted subreddit) say nothing about
/// endpoint health, so the default classifier only counts transport-level
/// transients and rate limiting.
pub type FailureClassifier = Arc<dyn Fn(&ScrapeError) -> bool + Send + Sync>;

/// Configuration for a [`CircuitBreaker`].
pub struct CircuitBreakerConfig {
    pub(crate) failure_threshold: u32,
    pub(crate) cool_down: Duration,
    pub(crate) success_threshold: u32,
    pub(crate) name: String,
    pub(crate) classifier: FailureClassifier,
    pub(crate) event_listeners: EventListeners<CircuitEvent>,
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

/// Builder for [`CircuitBreakerConfig`].
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: u32,
    cool_down: Duration,
    success_threshold: u32,
    name: String,
    classifier: FailureClassifier,
    event_listeners: EventListeners<CircuitEvent>,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - failure_threshold: 5 consecutive failures
    /// - cool_down: 30 seconds
    /// - success_threshold: 2 consecutive half-open successes
    /// - name: `"<unnamed>"`
    pub fn new() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            success_threshold: 2,
            name: "<unnamed>".to_string(),
            classifier: Arc::new(|err: &ScrapeError| {
                matches!(
                    err,
                    ScrapeError::Transient { .. } | ScrapeError::RateLimited { .. }
                )
            }),
            event_listeners: EventListeners::new(),
        }
    }

    /// Consecutive failures that trip the circuit open.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// How long the circuit stays open before permitting a probe.
    pub fn cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    /// Consecutive half-open successes required to re-close.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Sets the endpoint name used in errors, events, and logs.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the failure classifier.
    pub fn failure_classifier<F>(mut self, f: F) -> Self
    where
        F: Fn(&ScrapeError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(f);
        self
    }

    /// Registers a callback on every state transition.
    pub fn on_state_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let CircuitEvent::StateTransition { from, to, .. } = event {
                f(*from, *to);
            }
        }));
        self
    }

    /// Builds the breaker.
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cool_down: self.cool_down,
            success_threshold: self.success_threshold,
            name: self.name,
            classifier: self.classifier,
            event_listeners: self.event_listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let breaker = CircuitBreakerConfig::builder().build();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn zero_thresholds_are_clamped() {
        let breaker = CircuitBreakerConfig::builder()
            .failure_threshold(0)
            .success_threshold(0)
            .build();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
