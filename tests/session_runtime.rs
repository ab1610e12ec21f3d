//! End-to-end session scenarios against a mock forum.

mod common;

use common::*;
use snooscope_core::{Event, EventKind, Session, SessionStatus};
use snooscope_store::{Page, PostFilter, SessionPatch};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn happy_path_single_subreddit() {
    let server = MockServer::start().await;
    mount_listing(&server, "python", &ids("py", 10)).await;

    let stack = stack(&server.uri());
    let mut events = stack.bus.subscribe(Some(vec![
        EventKind::SessionStarted,
        EventKind::Progress,
        EventKind::SessionCompleted,
    ]));

    let id = stack
        .engine
        .start(vec!["python".into()], default_options(10))
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(10)).await;

    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 10);
    assert_eq!(view.progress, 100.0);
    assert_eq!(view.plan[0].observed, 10);

    // the terminal frame publishes just after the row turns terminal
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (mut started, mut progress, mut completed) = (0, 0, 0);
    while let Some(event) = events.try_recv() {
        match event {
            Event::SessionStarted { .. } => started += 1,
            Event::Progress { .. } => progress += 1,
            Event::SessionCompleted { posts_scraped, .. } => {
                completed += 1;
                assert_eq!(posts_scraped, 10);
            }
            _ => {}
        }
    }
    assert_eq!(started, 1, "exactly one session_started");
    assert!(progress >= 1, "at least one progress frame");
    assert_eq!(completed, 1, "exactly one session_completed");

    let (_, total) = stack
        .store
        .query_posts(PostFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(total, 10);
}

#[tokio::test]
async fn parallel_session_covers_both_subreddits() {
    let server = MockServer::start().await;
    mount_listing(&server, "a", &ids("a", 5)).await;
    mount_listing(&server, "b", &ids("b", 5)).await;

    let stack = stack(&server.uri());
    let mut options = default_options(5);
    options.parallel = true;
    options.max_workers = 2;

    let id = stack
        .engine
        .start(vec!["a".into(), "b".into()], options)
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(10)).await;

    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.progress, 100.0);
    assert_eq!(view.posts_scraped, 10);
    for entry in &view.plan {
        assert_eq!(entry.observed, 5, "entry {} incomplete", entry.subreddit);
    }
}

#[tokio::test]
async fn more_workers_than_plan_entries_is_harmless() {
    let server = MockServer::start().await;
    mount_listing(&server, "solo", &ids("s", 3)).await;

    let stack = stack(&server.uri());
    let mut options = default_options(3);
    options.parallel = true;
    options.max_workers = 10;

    let id = stack
        .engine
        .start(vec!["solo".into()], options)
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(10)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 3);
}

#[tokio::test]
async fn zero_target_completes_immediately_at_full_progress() {
    let server = MockServer::start().await;
    let stack = stack(&server.uri());

    let id = stack
        .engine
        .start(vec!["python".into()], default_options(0))
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(5)).await;

    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 0);
    assert_eq!(view.progress, 100.0);
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn stop_mid_run_cancels_within_the_drain_budget() {
    let server = MockServer::start().await;
    // page one lands fast; later pages crawl so the stop arrives mid-run
    mount_paged_listing(
        &server,
        "slow",
        &[
            (ids("p1", 10), Some("c1")),
            (ids("p2", 10), Some("c2")),
            (ids("p3", 10), None),
        ],
        Duration::from_millis(400),
    )
    .await;

    let stack = stack(&server.uri());
    let mut progress_events = stack.bus.subscribe(Some(vec![EventKind::Progress]));

    let id = stack
        .engine
        .start(vec!["slow".into()], default_options(30))
        .await
        .unwrap();

    // wait for the first progress frame, then pull the plug
    tokio::time::timeout(Duration::from_secs(5), progress_events.recv())
        .await
        .expect("progress before stop")
        .expect("bus alive");
    let before = stack
        .engine
        .status(id)
        .await
        .unwrap()
        .unwrap()
        .posts_scraped;
    stack.engine.stop(id).await.unwrap();

    let view = wait_terminal(&stack.engine, id, Duration::from_secs(7)).await;
    assert_eq!(view.status, SessionStatus::Cancelled);
    assert!(view.posts_scraped >= before, "counters never decrease");
    let end = view.end_time.expect("terminal sessions carry end_time");
    assert!(end >= view.start_time);
    // drain stayed inside its budget (5s configured + slack)
    assert!((end - view.start_time).num_seconds() <= 7);
}

#[tokio::test]
async fn stop_is_idempotent_on_terminal_sessions() {
    let server = MockServer::start().await;
    mount_listing(&server, "python", &ids("py", 2)).await;

    let stack = stack(&server.uri());
    let id = stack
        .engine
        .start(vec!["python".into()], default_options(2))
        .await
        .unwrap();
    wait_terminal(&stack.engine, id, Duration::from_secs(10)).await;

    let first = stack.engine.stop(id).await.unwrap();
    let second = stack.engine.stop(id).await.unwrap();
    assert_eq!(first, SessionStatus::Completed);
    assert_eq!(second, SessionStatus::Completed);
}

#[tokio::test]
async fn transient_outage_is_absorbed_by_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/flaky/hot.json"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    mount_listing(&server, "flaky", &ids("f", 10)).await;

    let stack = stack(&server.uri());
    let id = stack
        .engine
        .start(vec!["flaky".into()], default_options(10))
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(15)).await;

    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 10);
    assert!(view.errors <= 3);

    // no duplicates slipped in
    let (posts, total) = stack
        .store
        .query_posts(PostFilter::default(), Page { limit: 100, offset: 0 })
        .await
        .unwrap();
    assert_eq!(total, 10);
    let mut ids: Vec<&str> = posts.iter().map(|p| p.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn hard_outage_trips_the_circuit_and_fails_the_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let stack = stack(&server.uri());
    let mut failed_events = stack.bus.subscribe(Some(vec![EventKind::SessionFailed]));

    let id = stack
        .engine
        .start(vec!["down".into()], default_options(10))
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(15)).await;

    assert_eq!(view.status, SessionStatus::Failed);
    assert!(view.error_message.is_some());

    let event = tokio::time::timeout(Duration::from_secs(2), failed_events.recv())
        .await
        .expect("session_failed frame")
        .unwrap();
    assert!(matches!(event, Event::SessionFailed { .. }));

    // the open circuit kept writes at zero
    let (_, total) = stack
        .store
        .query_posts(PostFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn missing_subreddit_is_recorded_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/gone/hot.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    mount_listing(&server, "alive", &ids("ok", 5)).await;

    let stack = stack(&server.uri());
    let id = stack
        .engine
        .start(vec!["gone".into(), "alive".into()], default_options(5))
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(10)).await;

    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.errors, 1);
    assert_eq!(view.posts_scraped, 5);
    let alive = view.plan.iter().find(|e| e.subreddit == "alive").unwrap();
    assert_eq!(alive.observed, 5);
}

#[tokio::test]
async fn progress_events_are_monotone_per_session() {
    let server = MockServer::start().await;
    mount_paged_listing(
        &server,
        "steady",
        &[
            (ids("q1", 10), Some("c1")),
            (ids("q2", 10), Some("c2")),
            (ids("q3", 10), None),
        ],
        Duration::from_millis(50),
    )
    .await;

    let stack = stack(&server.uri());
    let mut progress_events = stack.bus.subscribe(Some(vec![EventKind::Progress]));

    let id = stack
        .engine
        .start(vec!["steady".into()], default_options(30))
        .await
        .unwrap();
    wait_terminal(&stack.engine, id, Duration::from_secs(15)).await;

    let mut last = -1.0f64;
    let mut seen = 0;
    while let Some(Event::Progress { progress, .. }) = progress_events.try_recv() {
        assert!(progress >= last, "progress regressed: {last} -> {progress}");
        assert!(progress <= 100.0);
        last = progress;
        seen += 1;
    }
    assert!(seen >= 1);
}

#[tokio::test]
async fn restart_resumes_to_the_same_final_state() {
    let server = MockServer::start().await;
    mount_listing(&server, "resume", &ids("r", 20)).await;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("snooscope.db");
    let bus = snooscope_core::EventBus::default();
    let store = snooscope_store::Store::open(&db, snooscope_store::StoreConfig::default())
        .unwrap()
        .with_bus(bus.clone());

    // fabricate the wreckage of a crashed run: a running session with 8
    // posts already committed
    let mut session = Session::new(vec!["resume".into()], default_options(20));
    let id = session.session_id;
    session.status = SessionStatus::Running;
    session.plan[0].observed = 8;
    store.create_session(session.clone()).await.unwrap();
    let first_eight: Vec<snooscope_core::Post> = ids("r", 8)
        .iter()
        .map(|pid| {
            snooscope_client::parse_post(&post_data(pid, "resume")).unwrap()
        })
        .collect();
    store.upsert_posts(first_eight, id).await.unwrap();
    store
        .update_session(
            id,
            SessionPatch {
                plan: Some(session.plan.clone()),
                ..SessionPatch::default()
            },
        )
        .await
        .unwrap();

    // "restart": a fresh engine over the same store file
    let engine = snooscope_engine::SessionEngine::builder(
        store.clone(),
        bus.clone(),
        test_client(&server.uri(), 200.0),
    )
    .config(fast_engine_config())
    .build();
    let restored = engine.resume().await.unwrap();
    assert_eq!(restored, 1);

    let view = wait_terminal(&engine, id, Duration::from_secs(15)).await;
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 20);
    assert_eq!(view.plan[0].observed, 20);

    // set-equal to an uninterrupted run: exactly the 20 distinct ids
    let committed = store.session_post_ids(id).await.unwrap();
    assert_eq!(committed.len(), 20);
    let (_, total) = store
        .query_posts(PostFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(total, 20);
}

#[tokio::test]
async fn duplicate_pages_do_not_overcount() {
    let server = MockServer::start().await;
    // both pages return the same ten ids; the cap is on distinct posts
    mount_paged_listing(
        &server,
        "dupes",
        &[
            (ids("d", 10), Some("c1")),
            (ids("d", 10), None),
        ],
        Duration::from_millis(10),
    )
    .await;

    let stack = stack(&server.uri());
    let id = stack
        .engine
        .start(vec!["dupes".into()], default_options(15))
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(10)).await;

    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 10, "duplicates must not inflate counters");
    let (_, total) = stack
        .store
        .query_posts(PostFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(total, 10);
}

#[tokio::test]
async fn min_score_filter_does_not_consume_capacity() {
    let server = MockServer::start().await;
    // 10 posts, half below the score bar; target of 5 should still fill
    let mut children = Vec::new();
    for (i, pid) in ids("m", 10).iter().enumerate() {
        let mut data = post_data(pid, "scored");
        data["score"] = serde_json::json!(if i % 2 == 0 { 100 } else { 1 });
        children.push(serde_json::json!({ "kind": "t3", "data": data }));
    }
    let body = serde_json::json!({
        "kind": "Listing",
        "data": { "after": null, "children": children }
    });
    Mock::given(method("GET"))
        .and(path("/r/scored/hot.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let stack = stack(&server.uri());
    let mut options = default_options(5);
    options.min_score = Some(50);
    let id = stack
        .engine
        .start(vec!["scored".into()], options)
        .await
        .unwrap();
    let view = wait_terminal(&stack.engine, id, Duration::from_secs(10)).await;

    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.posts_scraped, 5);
    let (posts, _) = stack
        .store
        .query_posts(PostFilter::default(), Page::default())
        .await
        .unwrap();
    assert!(posts.iter().all(|p| p.score >= 50));
}
