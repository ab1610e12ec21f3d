//! Control API for snooscope: session RPC, the data query surface, and
//! the live-event stream the dashboard hangs off.
//!
//! The binary in this crate wires the whole system together —
//! store, pacing, circuit, client, engine — and serves the routes in
//! [`routes::router`]. The pieces are public so integration tests can
//! assemble the same stack against mock backends.

pub mod config;
pub mod error;
pub mod routes;
pub mod ws;

pub use config::{AppConfig, ConfigError};
pub use error::ApiError;
pub use routes::{router, AppState};

use snooscope_admission::{AdmissionToken, PacerConfig};
use snooscope_circuit::{CircuitBreaker, CircuitBreakerConfig};
use snooscope_client::{RedditClient, RedditClientConfig};
use snooscope_core::{Event, EventBus, ScrapeError};
use snooscope_engine::{EngineConfig, SessionEngine};
use snooscope_store::{Store, StoreConfig};

/// Assembles the full application stack from a resolved configuration.
///
/// The forum circuit reports its transitions onto the event bus as
/// metric frames, so circuit history survives in the metrics table via
/// any subscriber that records them and is visible to live dashboards.
pub fn build_state(config: &AppConfig, store: Store, bus: EventBus) -> Result<AppState, ScrapeError> {
    let admission: AdmissionToken = if config.shared_pacing {
        PacerConfig::builder()
            .rate(config.forum_rate)
            .max_rate(config.forum_max_rate)
            .name("forum")
            .build_shared(&config.store_path)
            .map_err(|e| ScrapeError::fatal(format!("shared pacing init: {e}")))?
            .into()
    } else {
        PacerConfig::builder()
            .rate(config.forum_rate)
            .max_rate(config.forum_max_rate)
            .name("forum")
            .build_local()
            .into()
    };

    let transition_bus = bus.clone();
    let circuit: CircuitBreaker = CircuitBreakerConfig::builder()
        .failure_threshold(config.failure_threshold)
        .cool_down(config.cool_down)
        .success_threshold(config.success_threshold)
        .name("forum")
        .on_state_transition(move |from, to| {
            transition_bus.publish(Event::Metric {
                ts: chrono::Utc::now(),
                operation: format!("circuit_{}_{}", from.as_str(), to.as_str()),
                duration_ms: 0,
                ok: to == snooscope_circuit::CircuitState::Closed,
            });
        })
        .build();

    let mut client_config = RedditClientConfig::builder();
    if let Some(forum_url) = &config.forum_url {
        client_config = client_config.base_url(forum_url.clone());
    }
    if let Some(user_agent) = &config.user_agent {
        client_config = client_config.user_agent(user_agent.clone());
    }
    if let (Some(id), Some(secret)) = (&config.client_id, &config.client_secret) {
        client_config = client_config.credentials(id.clone(), secret.clone());
    }
    let client = RedditClient::new(client_config.build(), admission, circuit)?;

    let engine_config = EngineConfig {
        circuit_fail_after: config.cool_down * 5,
        circuit_breather: config.cool_down / 2,
        ..EngineConfig::default()
    };
    let engine = SessionEngine::builder(store.clone(), bus.clone(), client)
        .config(engine_config)
        .build();

    Ok(AppState {
        engine,
        store,
        bus,
        config_view: config.public_view(),
    })
}

/// Opens the store for the configured path, with the bus attached for
/// `store_write` frames.
pub fn open_store(config: &AppConfig, bus: &EventBus) -> Result<Store, snooscope_store::StoreError> {
    Ok(Store::open(&config.store_path, StoreConfig::default())?.with_bus(bus.clone()))
}
