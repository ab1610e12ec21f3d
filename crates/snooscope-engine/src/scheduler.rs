//! Fan-out of a session's plan across workers.
//!
//! Workers pull plan entries from a shared queue and drive each one to
//! its target count. They share one admission token and one circuit for
//! the forum (held inside the client), so adding workers never adds
//! request pressure, only overlap.

use crate::analytics::TrendSummary;
use crate::engine::Inner;
use chrono::Utc;
use futures::future::join_all;
use snooscope_client::{ContentEnricher, RedditClient};
use snooscope_core::{
    Event, MetricSample, Post, ScrapeError, Session, SessionOptions, SessionStatus,
};
use snooscope_store::SessionPatch;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Drives one session from `queued` to a terminal state.
pub(crate) async fn run_session(inner: Arc<Inner>, session_id: Uuid) {
    let Some(handle) = inner.sessions.get(&session_id) else {
        return;
    };
    let session = Arc::clone(&handle.session);
    let cancel = handle.cancel.clone();
    drop(handle);

    let run = Arc::new(SessionRun::new(inner, session_id, session, cancel));
    run.drive().await;
}

struct SessionRun {
    inner: Arc<Inner>,
    session_id: Uuid,
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
    client: RedditClient,
    enricher: Mutex<Option<ContentEnricher>>,
    queue: Mutex<VecDeque<usize>>,
    dirty: AtomicBool,
    failure: Mutex<Option<String>>,
    /// Post ids already attributed to this session; duplicates never
    /// consume plan capacity, which is what makes restart idempotent.
    committed: Mutex<HashSet<String>>,
    seen_users: Mutex<HashSet<String>>,
    trend: Mutex<TrendSummary>,
    options: SessionOptions,
}

impl SessionRun {
    fn new(
        inner: Arc<Inner>,
        session_id: Uuid,
        session: Arc<Mutex<Session>>,
        cancel: CancellationToken,
    ) -> Self {
        let (options, pending): (SessionOptions, VecDeque<usize>) = {
            let s = session.lock().unwrap();
            let pending = s
                .plan
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.is_done())
                .map(|(i, _)| i)
                .collect();
            (s.options.clone(), pending)
        };
        let client = inner.client.scoped(cancel.clone());
        Self {
            client,
            session_id,
            session,
            cancel,
            enricher: Mutex::new(None),
            queue: Mutex::new(pending),
            dirty: AtomicBool::new(false),
            failure: Mutex::new(None),
            committed: Mutex::new(HashSet::new()),
            seen_users: Mutex::new(HashSet::new()),
            trend: Mutex::new(TrendSummary::default()),
            options,
            inner,
        }
    }

    async fn drive(self: Arc<Self>) {
        if !self.mark_running().await {
            return;
        }

        // what the session already holds, so a restarted run neither
        // recounts nor misses anything
        match self.inner.store.session_post_ids(self.session_id).await {
            Ok(ids) => {
                *self.committed.lock().unwrap() = ids.into_iter().collect();
            }
            Err(err) => {
                self.fail(format!("store: {err}"));
            }
        }

        if self.options.extract_content {
            match ContentEnricher::new(
                self.inner.enricher_config.clone(),
                self.inner.enrich_admission.clone(),
                self.inner.enrich_circuit.clone(),
            ) {
                Ok(enricher) => *self.enricher.lock().unwrap() = Some(enricher),
                Err(err) => {
                    tracing::warn!(%err, "content enrichment disabled for this session")
                }
            }
        }

        // progress publisher doubles as the heartbeat
        let publisher_stop = CancellationToken::new();
        let publisher = tokio::spawn(
            Arc::clone(&self).progress_loop(publisher_stop.clone()),
        );

        let worker_count = {
            let pending = self.queue.lock().unwrap().len();
            if pending == 0 {
                0
            } else if self.options.parallel {
                pending.min(self.options.max_workers.max(1))
            } else {
                1
            }
        };

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            let run = Arc::clone(&self);
            workers.spawn(async move { run.worker_loop(worker).await });
        }

        // run until the workers are done; once a stop fires, the
        // remaining drain is bounded and stragglers are aborted
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = self.cancel.cancelled() => {
                    let drain = tokio::time::timeout(self.inner.config.drain_timeout, async {
                        while workers.join_next().await.is_some() {}
                    })
                    .await;
                    if drain.is_err() {
                        tracing::warn!(
                            session_id = %self.session_id,
                            "drain timeout, aborting workers"
                        );
                        workers.abort_all();
                        while workers.join_next().await.is_some() {}
                    }
                    break;
                }
            }
        }

        publisher_stop.cancel();
        let _ = publisher.await;

        self.finalize().await;
    }

    /// queued -> running, persisted before the start event is published.
    async fn mark_running(&self) -> bool {
        let now = Utc::now();
        let (status, subreddits) = {
            let mut s = self.session.lock().unwrap();
            if s.status.is_terminal() {
                return false;
            }
            if s.status == SessionStatus::Queued {
                s.status = SessionStatus::Running;
            }
            s.last_heartbeat = now;
            (s.status, s.subreddits.clone())
        };
        // a stop that raced the start leaves status at stopping; the
        // workers will observe it immediately
        let patch = SessionPatch {
            status: Some(status),
            last_heartbeat: Some(now),
            ..SessionPatch::default()
        };
        if let Err(err) = self.inner.store.update_session(self.session_id, patch).await {
            tracing::error!(session_id = %self.session_id, %err, "could not mark session running");
            self.fail(format!("store: {err}"));
        }
        self.inner.bus.publish(Event::SessionStarted {
            session_id: self.session_id,
            ts: now,
            subreddits,
        });
        true
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            if self.should_stop() {
                return;
            }
            let next = self.queue.lock().unwrap().pop_front();
            let Some(entry_idx) = next else { return };
            tracing::debug!(
                session_id = %self.session_id,
                worker,
                entry = entry_idx,
                "worker picked plan entry"
            );
            self.run_entry(entry_idx).await;
        }
    }

    /// Drives one plan entry to its target, the listing's end, or an
    /// error verdict.
    async fn run_entry(&self, entry_idx: usize) {
        let (subreddit, sort, time_filter, target, mut observed) = {
            let s = self.session.lock().unwrap();
            let e = &s.plan[entry_idx];
            (
                e.subreddit.clone(),
                e.sort,
                e.time_filter,
                e.target_count,
                e.observed,
            )
        };
        let mut after: Option<String> = None;
        let mut retries = 0u32;

        while observed < target && !self.should_stop() {
            let ts_start = Utc::now();
            let t0 = Instant::now();
            let page = self
                .client
                .list_posts(
                    &subreddit,
                    sort,
                    time_filter,
                    self.inner.config.page_size,
                    after.as_deref(),
                )
                .await;

            match page {
                Ok(page) => {
                    retries = 0;
                    self.record_metric(
                        MetricSample::new("list_posts", ts_start, t0.elapsed().as_millis() as u64, true)
                            .tag("subreddit", &subreddit)
                            .tag("skipped", page.skipped.to_string()),
                    );

                    let listing_exhausted = page.after.is_none();
                    let filtered = self.filter_posts(page.posts);
                    // filters run before the cap, so rejected posts never
                    // consume capacity; already-committed posts ride along
                    // as refreshes without consuming it either
                    let mut posts = self.cap_batch(filtered, (target - observed) as usize);
                    self.inner.analytics.apply(&mut posts);
                    self.enrich_batch(&mut posts).await;
                    self.accumulate_trends(&posts);

                    let authors = self.authors_to_fetch(&posts);
                    match self.commit_batch(posts).await {
                        Ok(new_posts) => {
                            observed += new_posts;
                            let mut s = self.session.lock().unwrap();
                            s.plan[entry_idx].observed = observed;
                            s.posts_scraped += u64::from(new_posts);
                            drop(s);
                            self.dirty.store(true, Ordering::Relaxed);
                        }
                        Err(err) if err.is_fatal() => {
                            self.fail(err.to_string());
                            return;
                        }
                        Err(err) => {
                            // StoreBusy past its own retry budget
                            self.count_error(format!("r/{subreddit}: {err}"));
                            return;
                        }
                    }
                    self.fetch_users(authors).await;

                    after = page.after;
                    if listing_exhausted {
                        if observed < target {
                            tracing::info!(
                                session_id = %self.session_id,
                                %subreddit,
                                observed,
                                target,
                                "listing exhausted before target"
                            );
                        }
                        return;
                    }
                }
                Err(err) if err.is_cancelled() => return,
                Err(err) if err.is_circuit_open() => {
                    self.record_metric(
                        MetricSample::new("list_posts", ts_start, t0.elapsed().as_millis() as u64, false)
                            .tag("subreddit", &subreddit)
                            .tag("error", "circuit_open"),
                    );
                    if let Some(open_for) = self.client.circuit().open_duration() {
                        if open_for >= self.inner.config.circuit_fail_after {
                            self.fail(format!(
                                "forum circuit open for {}s",
                                open_for.as_secs()
                            ));
                            return;
                        }
                    }
                    // breather outside the retry budget
                    if !self.sleep_cancellable(self.inner.config.circuit_breather).await {
                        return;
                    }
                }
                Err(err) if err.is_transient() => {
                    retries += 1;
                    self.record_metric(
                        MetricSample::new("list_posts", ts_start, t0.elapsed().as_millis() as u64, false)
                            .tag("subreddit", &subreddit),
                    );
                    if retries > self.inner.config.worker_retry_limit {
                        self.count_error(format!("r/{subreddit}: {err}"));
                        return;
                    }
                    let backoff = worker_backoff(
                        self.inner.config.worker_backoff_base,
                        self.inner.config.worker_backoff_cap,
                        retries,
                    );
                    tracing::debug!(
                        session_id = %self.session_id,
                        %subreddit,
                        retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "worker backing off"
                    );
                    if !self.sleep_cancellable(backoff).await {
                        return;
                    }
                }
                Err(err) if err.is_fatal() => {
                    self.fail(err.to_string());
                    return;
                }
                Err(err) => {
                    // private, banned, or nonexistent subreddit
                    tracing::warn!(
                        session_id = %self.session_id,
                        %subreddit,
                        %err,
                        "plan entry abandoned"
                    );
                    self.count_error(format!("r/{subreddit}: {err}"));
                    return;
                }
            }
        }
    }

    /// Keeps every already-committed post (a free refresh) and at most
    /// `fresh_budget` new ones.
    fn cap_batch(&self, posts: Vec<Post>, mut fresh_budget: usize) -> Vec<Post> {
        let committed = self.committed.lock().unwrap();
        let mut batch = Vec::with_capacity(posts.len());
        for post in posts {
            if committed.contains(&post.id) {
                batch.push(post);
            } else if fresh_budget > 0 {
                fresh_budget -= 1;
                batch.push(post);
            }
        }
        batch
    }

    fn filter_posts(&self, posts: Vec<Post>) -> Vec<Post> {
        let min_score = self.options.min_score;
        let max_age = self
            .options
            .max_age_days
            .map(|days| Utc::now().timestamp() - i64::from(days) * 86_400);
        posts
            .into_iter()
            .filter(|p| p.author.is_some())
            .filter(|p| self.options.include_nsfw || !p.is_nsfw)
            .filter(|p| min_score.map_or(true, |min| p.score >= min))
            .filter(|p| max_age.map_or(true, |cutoff| p.created_utc >= cutoff))
            .collect()
    }

    async fn enrich_batch(&self, posts: &mut [Post]) {
        let enricher = self.enricher.lock().unwrap().clone();
        let Some(enricher) = enricher else { return };
        let previews = join_all(posts.iter().map(|post| {
            let enricher = enricher.clone();
            let link = post.link_url.clone();
            async move {
                match link {
                    Some(url) => enricher.enrich(&url).await,
                    None => None,
                }
            }
        }))
        .await;
        for (post, preview) in posts.iter_mut().zip(previews) {
            post.link_preview = preview;
        }
    }

    fn accumulate_trends(&self, posts: &[Post]) {
        if posts.is_empty() {
            return;
        }
        let batch = self.inner.analytics.trends.summarize(posts);
        let mut trend = self.trend.lock().unwrap();
        for (term, n) in batch.top_terms {
            match trend.top_terms.iter_mut().find(|(t, _)| *t == term) {
                Some((_, existing)) => *existing += n,
                None => trend.top_terms.push((term, n)),
            }
        }
        for (subreddit, n) in batch.posts_per_subreddit {
            *trend.posts_per_subreddit.entry(subreddit).or_default() += n;
        }
    }

    async fn commit_batch(&self, posts: Vec<Post>) -> Result<u32, ScrapeError> {
        if posts.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = posts.iter().map(|p| p.id.clone()).collect();
        let ts_start = Utc::now();
        let t0 = Instant::now();
        let stats = self
            .inner
            .store
            .upsert_posts(posts, self.session_id)
            .await?;
        self.committed.lock().unwrap().extend(ids);
        let duration_ms = t0.elapsed().as_millis() as u64;
        self.record_metric(
            MetricSample::new("batch_commit", ts_start, duration_ms, true)
                .tag("written", stats.written.to_string()),
        );
        self.inner.bus.publish(Event::Metric {
            ts: ts_start,
            operation: "batch_commit".to_string(),
            duration_ms,
            ok: true,
        });
        Ok(stats.new_for_session as u32)
    }

    fn authors_to_fetch(&self, posts: &[Post]) -> Vec<String> {
        if !self.options.include_users {
            return Vec::new();
        }
        let mut seen = self.seen_users.lock().unwrap();
        posts
            .iter()
            .filter_map(|p| p.author.clone())
            .filter(|a| seen.insert(a.clone()))
            .collect()
    }

    /// Best-effort profile fetches; a missing or suspended account is
    /// not an error.
    async fn fetch_users(&self, authors: Vec<String>) {
        if authors.is_empty() {
            return;
        }
        let mut users = Vec::with_capacity(authors.len());
        for author in authors {
            if self.should_stop() {
                break;
            }
            match self.client.get_user(&author).await {
                Ok(user) => users.push(user),
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    tracing::debug!(%author, %err, "user fetch skipped");
                }
            }
        }
        if users.is_empty() {
            return;
        }
        let new_users = match self.inner.store.upsert_users(users, self.session_id).await {
            Ok(stats) => stats.new_for_session as u64,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, %err, "user batch failed");
                return;
            }
        };
        if new_users > 0 {
            self.session.lock().unwrap().users_scraped += new_users;
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Publishes coalesced progress and keeps the heartbeat fresh. At
    /// most one frame per tick leaves the bus, however many batches
    /// landed in between.
    async fn progress_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut tick = tokio::time::interval(self.inner.config.coalesce_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tick.tick() => {}
            }
            let now = Utc::now();
            let was_dirty = self.dirty.swap(false, Ordering::Relaxed);
            let (patch, event) = {
                let mut s = self.session.lock().unwrap();
                let computed = Session::compute_progress(&s.plan);
                if computed > s.progress {
                    s.progress = computed;
                }
                s.last_heartbeat = now;
                let patch = SessionPatch {
                    progress: Some(s.progress),
                    last_heartbeat: Some(now),
                    plan: was_dirty.then(|| s.plan.clone()),
                    errors: was_dirty.then_some(s.errors),
                    ..SessionPatch::default()
                };
                let event = was_dirty.then(|| Event::Progress {
                    session_id: self.session_id,
                    ts: now,
                    progress: s.progress,
                    posts_scraped: s.posts_scraped,
                    users_scraped: s.users_scraped,
                    errors: s.errors,
                });
                (patch, event)
            };
            if let Err(err) = self.inner.store.update_session(self.session_id, patch).await {
                tracing::warn!(session_id = %self.session_id, %err, "progress persist failed");
                continue;
            }
            // row is durable; now the frame may leave the process
            if let Some(event) = event {
                self.inner.bus.publish(event);
            }
        }
    }

    async fn finalize(&self) {
        // claiming the handle is what finalizes; the watchdog may have
        // beaten us to it
        if self.inner.sessions.remove(&self.session_id).is_none() {
            return;
        }
        let now = Utc::now();
        let failure = self.failure.lock().unwrap().clone();
        let (status, patch, event, trend_posts) = {
            let mut s = self.session.lock().unwrap();
            let computed = Session::compute_progress(&s.plan);
            if computed > s.progress {
                s.progress = computed;
            }
            let status = if let Some(_msg) = &failure {
                SessionStatus::Failed
            } else if self.cancel.is_cancelled() || s.status == SessionStatus::Stopping {
                SessionStatus::Cancelled
            } else {
                SessionStatus::Completed
            };
            s.status = status;
            s.end_time = Some(now);
            s.error_message = failure.clone();
            let patch = SessionPatch {
                status: Some(status),
                plan: Some(s.plan.clone()),
                progress: Some(s.progress),
                errors: Some(s.errors),
                end_time: Some(Some(now)),
                error_message: Some(failure.clone()),
                last_heartbeat: Some(now),
            };
            let event = match status {
                SessionStatus::Completed => Event::SessionCompleted {
                    session_id: self.session_id,
                    ts: now,
                    posts_scraped: s.posts_scraped,
                    users_scraped: s.users_scraped,
                },
                SessionStatus::Failed => Event::SessionFailed {
                    session_id: self.session_id,
                    ts: now,
                    error: failure.clone().unwrap_or_default(),
                },
                _ => Event::StatusUpdate {
                    session_id: self.session_id,
                    ts: now,
                    status,
                },
            };
            (status, patch, event, s.posts_scraped)
        };

        if let Err(err) = self.inner.store.update_session(self.session_id, patch).await {
            tracing::error!(session_id = %self.session_id, %err, "terminal persist failed");
        }
        self.inner.bus.publish(event);
        tracing::info!(
            session_id = %self.session_id,
            status = status.as_str(),
            "session finished"
        );

        if status == SessionStatus::Completed && trend_posts > 0 {
            let trend = self.trend.lock().unwrap().clone();
            let mut top = trend.top_terms;
            top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            top.truncate(10);
            let summary = top
                .into_iter()
                .map(|(t, n)| format!("{t}:{n}"))
                .collect::<Vec<_>>()
                .join(",");
            self.record_metric(
                MetricSample::new("trend_summary", now, 0, true)
                    .tag("top_terms", summary)
                    .tag("posts", trend_posts.to_string()),
            );
        }
        self.inner.metrics.flush().await;
    }

    fn fail(&self, message: String) {
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            tracing::error!(session_id = %self.session_id, %message, "session failing");
            *failure = Some(message);
        }
        drop(failure);
        self.cancel.cancel();
    }

    fn count_error(&self, message: String) {
        let (errors, budget) = {
            let mut s = self.session.lock().unwrap();
            s.errors += 1;
            s.error_message = Some(message.clone());
            (
                s.errors,
                s.plan.len() as u64 * self.inner.config.error_budget_factor,
            )
        };
        self.dirty.store(true, Ordering::Relaxed);
        tracing::warn!(session_id = %self.session_id, errors, %message, "session error recorded");
        if errors > budget {
            self.fail(format!("error budget exceeded ({errors} errors)"));
        }
    }

    fn should_stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        let s = self.session.lock().unwrap();
        s.status == SessionStatus::Stopping || s.status.is_terminal()
    }

    /// Sleeps unless cancelled; false means stop now.
    async fn sleep_cancellable(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    fn record_metric(&self, sample: MetricSample) {
        self.inner
            .metrics
            .record(sample.tag("session", self.session_id.to_string()));
    }
}

/// Worker-local ladder: 1s·1.5^k, capped.
fn worker_backoff(base: Duration, cap: Duration, retries: u32) -> Duration {
    let grown = base.as_secs_f64() * 1.5f64.powi(retries.saturating_sub(1) as i32);
    Duration::from_secs_f64(grown.min(cap.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_grows_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        assert_eq!(worker_backoff(base, cap, 1), Duration::from_secs(1));
        assert_eq!(worker_backoff(base, cap, 2), Duration::from_secs_f64(1.5));
        assert!(worker_backoff(base, cap, 3) > worker_backoff(base, cap, 2));
        assert_eq!(worker_backoff(base, cap, 30), cap);
    }
}
