//! The session engine: durable lifecycle, restart resume, and the
//! heartbeat watchdog.
//!
//! The engine is the sole mutator of session rows. Every transition is
//! persisted before the matching event goes out on the bus, which makes
//! the store the single source of truth and lets a restarted process
//! pick sessions back up from their rows alone.

use crate::analytics::Analytics;
use crate::metrics::MetricsBuffer;
use crate::scheduler;
use chrono::Utc;
use dashmap::DashMap;
use snooscope_admission::{AdmissionToken, PacerConfig};
use snooscope_circuit::{CircuitBreaker, CircuitBreakerConfig};
use snooscope_client::{EnricherConfig, RedditClient};
use snooscope_core::{
    Event, EventBus, ScrapeError, Session, SessionOptions, SessionStatus, SessionView,
};
use snooscope_store::{SessionFilter, SessionPatch, Store};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long `stop` waits for workers before hard-finalizing.
    pub drain_timeout: Duration,
    /// Progress publish cadence; also the heartbeat cadence.
    pub coalesce_interval: Duration,
    /// A running session whose heartbeat is older than this is declared
    /// dead by the watchdog.
    pub heartbeat_timeout: Duration,
    /// Session fails once the forum circuit has been unhealthy this long.
    pub circuit_fail_after: Duration,
    /// Sleep taken when a worker meets an open circuit; outside the
    /// retry budget.
    pub circuit_breather: Duration,
    /// Transient retries per plan entry before it is abandoned.
    pub worker_retry_limit: u32,
    pub worker_backoff_base: Duration,
    pub worker_backoff_cap: Duration,
    /// Session fails once `errors > plan_len * error_budget_factor`.
    pub error_budget_factor: u64,
    /// Listing page size requested from the forum.
    pub page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let coalesce_interval = Duration::from_millis(250);
        Self {
            drain_timeout: Duration::from_secs(30),
            coalesce_interval,
            heartbeat_timeout: coalesce_interval * 3,
            circuit_fail_after: Duration::from_secs(150),
            circuit_breather: Duration::from_secs(15),
            worker_retry_limit: 5,
            worker_backoff_base: Duration::from_secs(1),
            worker_backoff_cap: Duration::from_secs(30),
            error_budget_factor: 3,
            page_size: 100,
        }
    }
}

pub(crate) struct SessionHandle {
    pub(crate) session: Arc<Mutex<Session>>,
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct Inner {
    pub(crate) store: Store,
    pub(crate) bus: EventBus,
    pub(crate) client: RedditClient,
    pub(crate) enrich_admission: AdmissionToken,
    pub(crate) enrich_circuit: CircuitBreaker,
    pub(crate) enricher_config: EnricherConfig,
    pub(crate) analytics: Analytics,
    pub(crate) config: EngineConfig,
    pub(crate) metrics: MetricsBuffer,
    pub(crate) sessions: DashMap<Uuid, SessionHandle>,
    pub(crate) shutdown: CancellationToken,
}

/// Owns session lifecycles. Cheap to clone.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Inner>,
    background: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

/// Builder for [`SessionEngine`].
pub struct SessionEngineBuilder {
    store: Store,
    bus: EventBus,
    client: RedditClient,
    enrich_admission: Option<AdmissionToken>,
    enrich_circuit: Option<CircuitBreaker>,
    enricher_config: EnricherConfig,
    analytics: Analytics,
    config: EngineConfig,
}

impl SessionEngineBuilder {
    pub fn new(store: Store, bus: EventBus, client: RedditClient) -> Self {
        Self {
            store,
            bus,
            client,
            enrich_admission: None,
            enrich_circuit: None,
            enricher_config: EnricherConfig::default(),
            analytics: Analytics::default(),
            config: EngineConfig::default(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Admission and circuit for the content enricher's failure domain.
    pub fn enricher(
        mut self,
        admission: AdmissionToken,
        circuit: CircuitBreaker,
        config: EnricherConfig,
    ) -> Self {
        self.enrich_admission = Some(admission);
        self.enrich_circuit = Some(circuit);
        self.enricher_config = config;
        self
    }

    pub fn analytics(mut self, analytics: Analytics) -> Self {
        self.analytics = analytics;
        self
    }

    /// Builds the engine and spawns its background tasks (metric flusher
    /// and heartbeat watchdog).
    pub fn build(self) -> SessionEngine {
        let shutdown = CancellationToken::new();
        let metrics = MetricsBuffer::new(self.store.clone());
        let inner = Arc::new(Inner {
            enrich_admission: self.enrich_admission.unwrap_or_else(|| {
                PacerConfig::builder()
                    .rate(2.0)
                    .name("content")
                    .build_local()
                    .into()
            }),
            enrich_circuit: self
                .enrich_circuit
                .unwrap_or_else(|| CircuitBreakerConfig::builder().name("content").build()),
            enricher_config: self.enricher_config,
            analytics: self.analytics,
            config: self.config,
            metrics: metrics.clone(),
            sessions: DashMap::new(),
            shutdown: shutdown.clone(),
            store: self.store,
            bus: self.bus,
            client: self.client,
        });

        let flusher = tokio::spawn(metrics.run_flusher(shutdown.clone()));
        let watchdog = tokio::spawn(watchdog_loop(Arc::clone(&inner)));
        SessionEngine {
            inner,
            background: Arc::new(Mutex::new(vec![flusher, watchdog])),
        }
    }
}

impl SessionEngine {
    pub fn builder(store: Store, bus: EventBus, client: RedditClient) -> SessionEngineBuilder {
        SessionEngineBuilder::new(store, bus, client)
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validates the request, persists a queued session, and schedules it
    /// asynchronously. Returns as soon as the row is durable.
    pub async fn start(
        &self,
        subreddits: Vec<String>,
        options: SessionOptions,
    ) -> Result<Uuid, ScrapeError> {
        if subreddits.is_empty() || subreddits.iter().any(|s| s.trim().is_empty()) {
            return Err(ScrapeError::permanent("subreddits must be non-empty"));
        }
        let session = Session::new(subreddits, options);
        let session_id = session.session_id;
        self.inner.store.create_session(session.clone()).await?;
        self.spawn_session(session);
        tracing::info!(%session_id, "session accepted");
        Ok(session_id)
    }

    /// Requests a stop. Idempotent: terminal sessions report their
    /// status unchanged. Pending admission waits are cancelled at once;
    /// workers wind down between batches.
    pub async fn stop(&self, session_id: Uuid) -> Result<SessionStatus, ScrapeError> {
        // copy what we need out of the map entry; holding its guard
        // across an await would block the shard
        let live = self.inner.sessions.get(&session_id).map(|handle| {
            let cancel = handle.cancel.clone();
            let mut session = handle.session.lock().unwrap();
            if session.status.is_terminal() {
                (cancel, Some(session.status))
            } else {
                session.status = SessionStatus::Stopping;
                (cancel, None)
            }
        });
        if let Some((cancel, already_terminal)) = live {
            if let Some(status) = already_terminal {
                return Ok(status);
            }
            self.inner
                .store
                .update_session(
                    session_id,
                    SessionPatch {
                        status: Some(SessionStatus::Stopping),
                        ..SessionPatch::default()
                    },
                )
                .await?;
            self.inner.bus.publish(Event::StatusUpdate {
                session_id,
                ts: Utc::now(),
                status: SessionStatus::Stopping,
            });
            cancel.cancel();
            return Ok(SessionStatus::Stopping);
        }

        // no live task: act on the row alone
        let Some(row) = self.inner.store.get_session(session_id).await? else {
            return Err(ScrapeError::NotFound {
                what: format!("session {session_id}"),
            });
        };
        if row.status.is_terminal() {
            return Ok(row.status);
        }
        self.inner
            .store
            .update_session(
                session_id,
                SessionPatch {
                    status: Some(SessionStatus::Cancelled),
                    end_time: Some(Some(Utc::now())),
                    ..SessionPatch::default()
                },
            )
            .await?;
        self.inner.bus.publish(Event::StatusUpdate {
            session_id,
            ts: Utc::now(),
            status: SessionStatus::Cancelled,
        });
        Ok(SessionStatus::Cancelled)
    }

    /// Live view of a session, preferring in-memory state for freshness.
    pub async fn status(&self, session_id: Uuid) -> Result<Option<SessionView>, ScrapeError> {
        if let Some(handle) = self.inner.sessions.get(&session_id) {
            let view = handle.session.lock().unwrap().view();
            return Ok(Some(view));
        }
        Ok(self
            .inner
            .store
            .get_session(session_id)
            .await?
            .map(|s| s.view()))
    }

    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionView>, ScrapeError> {
        let mut views: Vec<SessionView> = self
            .inner
            .store
            .list_sessions(filter)
            .await?
            .into_iter()
            .map(|s| s.view())
            .collect();
        // live counters are fresher than the last persisted tick
        for view in views.iter_mut() {
            if let Some(handle) = self.inner.sessions.get(&view.session_id) {
                *view = handle.session.lock().unwrap().view();
            }
        }
        Ok(views)
    }

    /// Restores active sessions after a restart. Sessions found
    /// `running` lost their tasks with the old process, so they re-enter
    /// `queued` and are re-driven with their persisted plan and counters.
    pub async fn resume(&self) -> Result<usize, ScrapeError> {
        let active = self.inner.store.load_active_sessions().await?;
        let mut restored = 0usize;
        for mut session in active {
            if self.inner.sessions.contains_key(&session.session_id) {
                continue;
            }
            if session.status == SessionStatus::Running {
                session.status = SessionStatus::Queued;
                self.inner
                    .store
                    .update_session(
                        session.session_id,
                        SessionPatch {
                            status: Some(SessionStatus::Queued),
                            ..SessionPatch::default()
                        },
                    )
                    .await?;
            }
            tracing::info!(
                session_id = %session.session_id,
                posts_scraped = session.posts_scraped,
                "restoring session after restart"
            );
            self.spawn_session(session);
            restored += 1;
        }
        Ok(restored)
    }

    /// Stops every live session and waits for the drain, then flushes
    /// metrics.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Err(err) = self.stop(id).await {
                tracing::warn!(session_id = %id, %err, "stop during shutdown failed");
            }
        }
        let deadline = tokio::time::Instant::now() + self.inner.config.drain_timeout;
        while !self.inner.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.inner.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.background.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn_session(&self, session: Session) {
        let session_id = session.session_id;
        let handle = SessionHandle {
            session: Arc::new(Mutex::new(session)),
            cancel: CancellationToken::new(),
        };
        self.inner.sessions.insert(session_id, handle);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            scheduler::run_session(inner, session_id).await;
        });
    }
}

/// Fails `running` sessions whose heartbeat has gone stale. In practice
/// this catches tasks lost to a panic; live sessions heartbeat on every
/// coalesce tick.
async fn watchdog_loop(inner: Arc<Inner>) {
    let mut tick = tokio::time::interval(inner.config.heartbeat_timeout);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        let running = match inner
            .store
            .list_sessions(SessionFilter {
                status: Some(SessionStatus::Running),
                limit: None,
            })
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(%err, "watchdog could not list sessions");
                continue;
            }
        };
        let now = Utc::now();
        for row in running {
            let age = now - row.last_heartbeat;
            if age
                < chrono::Duration::from_std(inner.config.heartbeat_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1))
            {
                continue;
            }
            tracing::warn!(
                session_id = %row.session_id,
                heartbeat_age_ms = age.num_milliseconds(),
                "heartbeat timeout, failing session"
            );
            if let Some((_, handle)) = inner.sessions.remove(&row.session_id) {
                handle.cancel.cancel();
            }
            let patch = SessionPatch {
                status: Some(SessionStatus::Failed),
                end_time: Some(Some(now)),
                error_message: Some(Some("heartbeat timeout".to_string())),
                ..SessionPatch::default()
            };
            if let Err(err) = inner.store.update_session(row.session_id, patch).await {
                tracing::warn!(session_id = %row.session_id, %err, "watchdog patch failed");
                continue;
            }
            inner.bus.publish(Event::SessionFailed {
                session_id: row.session_id,
                ts: now,
                error: "heartbeat timeout".to_string(),
            });
        }
    }
}
