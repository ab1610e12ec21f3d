use crate::adaptive::AdaptiveRate;
use crate::config::PacerConfig;
use crate::events::AdmissionEvent;
use crate::shared::SharedPacer;
use snooscope_core::ScrapeError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// What happened to the single attempt made after `acquire()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    RateLimited,
    Error,
}

struct PacerState {
    last_grant: Option<Instant>,
    adaptive: AdaptiveRate,
}

struct PacerInner {
    state: Mutex<PacerState>,
    config: PacerConfig,
}

/// In-process admission token.
///
/// The last-grant timestamp sits behind a mutex; waiting callers sleep
/// outside the lock and re-contend, so a slot is only consumed at the
/// moment it is granted. Dropping a waiting `acquire()` future consumes
/// nothing.
#[derive(Clone)]
pub struct Pacer {
    inner: Arc<PacerInner>,
}

impl Pacer {
    pub(crate) fn new(config: PacerConfig) -> Self {
        let adaptive = AdaptiveRate::new(
            config.rate,
            config.min_rate,
            config.max_rate,
            config.window_size,
        );
        Self {
            inner: Arc::new(PacerInner {
                state: Mutex::new(PacerState {
                    last_grant: None,
                    adaptive,
                }),
                config,
            }),
        }
    }

    /// Waits for the next slot and consumes it. Returns how long the
    /// caller waited.
    pub async fn acquire(&self) -> Duration {
        let start = Instant::now();
        loop {
            let wait = {
                let mut state = self.inner.state.lock().unwrap();
                let interval = Duration::from_secs_f64(1.0 / state.adaptive.rate());
                let now = Instant::now();
                match state.last_grant {
                    Some(last) if now.duration_since(last) < interval => {
                        Some(interval - now.duration_since(last))
                    }
                    _ => {
                        state.last_grant = Some(now);
                        None
                    }
                }
            };
            match wait {
                None => {
                    let waited = start.elapsed();
                    self.inner
                        .config
                        .event_listeners
                        .emit(&AdmissionEvent::PermitGranted {
                            name: self.inner.config.name.clone(),
                            timestamp: Instant::now(),
                            wait_duration: waited,
                        });
                    #[cfg(feature = "metrics")]
                    metrics::counter!("admission_grants_total", "pacer" => self.inner.config.name.clone())
                        .increment(1);
                    return waited;
                }
                Some(d) => sleep(d).await,
            }
        }
    }

    /// Reports the outcome of the single attempt the last grant paid for.
    pub fn record_outcome(&self, outcome: Outcome) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            state.adaptive.observe(outcome)
        };
        self.inner
            .config
            .event_listeners
            .emit(&AdmissionEvent::OutcomeRecorded {
                name: self.inner.config.name.clone(),
                timestamp: Instant::now(),
                outcome,
            });
        if let Some((old_rate, new_rate)) = changed {
            self.inner
                .config
                .event_listeners
                .emit(&AdmissionEvent::RateChanged {
                    name: self.inner.config.name.clone(),
                    timestamp: Instant::now(),
                    old_rate,
                    new_rate,
                });
            #[cfg(feature = "tracing")]
            tracing::info!(
                pacer = %self.inner.config.name,
                old_rate,
                new_rate,
                "admission rate adjusted"
            );
            #[cfg(feature = "metrics")]
            metrics::gauge!("admission_rate", "pacer" => self.inner.config.name.clone())
                .set(new_rate);
        }
    }

    /// Current rate in permits per second.
    pub fn rate(&self) -> f64 {
        self.inner.state.lock().unwrap().adaptive.rate()
    }
}

/// Either pacing variant behind one call surface.
///
/// The scheduler hands one of these per remote domain to its workers;
/// workers call it, they never mint their own.
#[derive(Clone)]
pub enum AdmissionToken {
    Local(Pacer),
    Shared(SharedPacer),
}

impl AdmissionToken {
    pub async fn acquire(&self) -> Result<Duration, ScrapeError> {
        match self {
            AdmissionToken::Local(p) => Ok(p.acquire().await),
            AdmissionToken::Shared(p) => p.acquire().await,
        }
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        match self {
            AdmissionToken::Local(p) => p.record_outcome(outcome),
            AdmissionToken::Shared(p) => p.record_outcome(outcome),
        }
    }

    pub fn rate(&self) -> f64 {
        match self {
            AdmissionToken::Local(p) => p.rate(),
            AdmissionToken::Shared(p) => p.rate(),
        }
    }
}

impl From<Pacer> for AdmissionToken {
    fn from(p: Pacer) -> Self {
        AdmissionToken::Local(p)
    }
}

impl From<SharedPacer> for AdmissionToken {
    fn from(p: SharedPacer) -> Self {
        AdmissionToken::Shared(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacerConfig;

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let pacer = PacerConfig::builder().rate(1.0).build_local();
        let waited = pacer.acquire().await;
        assert!(waited < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn consecutive_acquires_are_spaced() {
        let pacer = PacerConfig::builder().rate(20.0).build_local();
        pacer.acquire().await;
        let start = Instant::now();
        pacer.acquire().await;
        // 20/s means at least ~50ms between grants
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_consume_the_slot() {
        let pacer = PacerConfig::builder().rate(2.0).build_local();
        pacer.acquire().await;

        // start a waiter and drop it mid-wait
        let waiter = pacer.acquire();
        let cancelled = tokio::time::timeout(Duration::from_millis(20), waiter).await;
        assert!(cancelled.is_err());

        // the next caller still gets the slot the cancelled waiter wanted
        let start = Instant::now();
        pacer.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn concurrent_acquires_respect_the_rate() {
        let pacer = PacerConfig::builder().rate(50.0).build_local();
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let p = pacer.clone();
            handles.push(tokio::spawn(async move { p.acquire().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // 5 grants at 50/s need at least 4 * 20ms of spacing
        assert!(start.elapsed() >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn outcomes_feed_the_adaptive_policy() {
        let pacer = PacerConfig::builder()
            .rate(4.0)
            .min_rate(0.1)
            .max_rate(10.0)
            .build_local();
        for _ in 0..10 {
            pacer.record_outcome(Outcome::Error);
        }
        assert!((pacer.rate() - 2.0).abs() < f64::EPSILON);
    }
}
