//! Shared fixtures for the integration suites: a mock forum, a fast
//! engine stack, and polling helpers.
#![allow(dead_code)]

use serde_json::{json, Value};
use snooscope_admission::PacerConfig;
use snooscope_circuit::CircuitBreakerConfig;
use snooscope_client::{RedditClient, RedditClientConfig};
use snooscope_core::{EventBus, SessionOptions, SessionStatus, SessionView};
use snooscope_engine::{EngineConfig, SessionEngine};
use snooscope_store::{Store, StoreConfig};
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn post_data(id: &str, subreddit: &str) -> Value {
    json!({
        "id": id,
        "title": format!("post {id} in {subreddit}"),
        "subreddit": subreddit,
        "score": 25,
        "num_comments": 4,
        "upvote_ratio": 0.88,
        "created_utc": 1_700_000_000.0 + 1.0,
        "url": format!("https://example.com/{id}"),
        "permalink": format!("/r/{subreddit}/comments/{id}/"),
        "selftext": "",
        "author": format!("author_{id}"),
        "is_self": false,
        "domain": "example.com"
    })
}

pub fn listing_json(subreddit: &str, ids: &[String], after: Option<&str>) -> Value {
    json!({
        "kind": "Listing",
        "data": {
            "after": after,
            "children": ids
                .iter()
                .map(|id| json!({ "kind": "t3", "data": post_data(id, subreddit) }))
                .collect::<Vec<_>>()
        }
    })
}

/// Ids `prefix_0..prefix_n`.
pub fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}_{i}")).collect()
}

/// Mounts a single-page listing for one subreddit.
pub async fn mount_listing(server: &MockServer, subreddit: &str, page_ids: &[String]) {
    Mock::given(method("GET"))
        .and(path(format!("/r/{subreddit}/hot.json")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(listing_json(subreddit, page_ids, None)),
        )
        .mount(server)
        .await;
}

/// Mounts a paginated listing. Pages after the first are keyed by the
/// cursor that leads into them; the cursorless first page is mounted
/// last so the narrower matchers win.
pub async fn mount_paged_listing(
    server: &MockServer,
    subreddit: &str,
    pages: &[(Vec<String>, Option<&str>)],
    page_delay: Duration,
) {
    let listing_path = format!("/r/{subreddit}/hot.json");
    let mut cursor_into_page: Option<&str> = None;
    let mut first_page: Option<ResponseTemplate> = None;
    for (page_ids, next_cursor) in pages {
        let response = ResponseTemplate::new(200)
            .set_body_json(listing_json(subreddit, page_ids, *next_cursor))
            .set_delay(page_delay);
        match cursor_into_page {
            Some(cursor) => {
                Mock::given(method("GET"))
                    .and(path(listing_path.clone()))
                    .and(query_param("after", cursor))
                    .respond_with(response)
                    .mount(server)
                    .await;
            }
            None => first_page = Some(response),
        }
        cursor_into_page = *next_cursor;
    }
    if let Some(response) = first_page {
        Mock::given(method("GET"))
            .and(path(listing_path))
            .respond_with(response)
            .mount(server)
            .await;
    }
}

/// Engine wired to a mock forum with fast timings.
pub struct TestStack {
    pub store: Store,
    pub bus: EventBus,
    pub engine: SessionEngine,
    _dir: tempfile::TempDir,
}

pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        drain_timeout: Duration::from_secs(5),
        coalesce_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_secs(5),
        circuit_fail_after: Duration::from_millis(400),
        circuit_breather: Duration::from_millis(50),
        worker_retry_limit: 5,
        worker_backoff_base: Duration::from_millis(20),
        worker_backoff_cap: Duration::from_millis(200),
        error_budget_factor: 3,
        page_size: 100,
    }
}

pub fn test_client(forum_url: &str, rate: f64) -> RedditClient {
    let admission = PacerConfig::builder()
        .rate(rate)
        .min_rate(0.5)
        .max_rate(rate.max(500.0))
        .name("forum")
        .build_local()
        .into();
    let circuit = CircuitBreakerConfig::builder()
        .failure_threshold(5)
        .cool_down(Duration::from_millis(500))
        .success_threshold(2)
        .name("forum")
        .build();
    RedditClient::new(
        RedditClientConfig::builder()
            .base_url(forum_url)
            .retry_base(Duration::from_millis(10))
            .max_retries(2)
            .build(),
        admission,
        circuit,
    )
    .expect("client")
}

pub fn stack_with(forum_url: &str, rate: f64) -> TestStack {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::default();
    let store = Store::open(dir.path().join("snooscope.db"), StoreConfig::default())
        .expect("store")
        .with_bus(bus.clone());
    let engine = SessionEngine::builder(store.clone(), bus.clone(), test_client(forum_url, rate))
        .config(fast_engine_config())
        .build();
    TestStack {
        store,
        bus,
        engine,
        _dir: dir,
    }
}

pub fn stack(forum_url: &str) -> TestStack {
    stack_with(forum_url, 200.0)
}

pub fn default_options(posts_per_subreddit: u32) -> SessionOptions {
    SessionOptions {
        posts_per_subreddit,
        ..SessionOptions::default()
    }
}

/// Polls until the session reaches a terminal status.
pub async fn wait_terminal(engine: &SessionEngine, id: Uuid, timeout: Duration) -> SessionView {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let view = engine
            .status(id)
            .await
            .expect("status")
            .expect("session exists");
        if view.status.is_terminal() {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {id} still {:?} after {timeout:?}",
            view.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Polls until the session reports the given status (terminal or not).
pub async fn wait_status(
    engine: &SessionEngine,
    id: Uuid,
    status: SessionStatus,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let view = engine
            .status(id)
            .await
            .expect("status")
            .expect("session exists");
        if view.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {id} is {:?}, wanted {status:?}",
            view.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
