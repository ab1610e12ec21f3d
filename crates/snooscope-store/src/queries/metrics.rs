//! Metric samples, retention, and database stats.

use crate::error::StoreError;
use crate::queries::{DatabaseStats, GcStats};
use crate::retry::with_busy_retry;
use crate::schema::to_ms;
use crate::Store;
use chrono::{DateTime, Utc};
use rusqlite::params;
use snooscope_core::MetricSample;

impl Store {
    /// Appends one sample.
    pub async fn record_metric(&self, sample: MetricSample) -> Result<(), StoreError> {
        self.record_metrics(vec![sample]).await
    }

    /// Appends a buffered batch of samples in one transaction.
    pub async fn record_metrics(&self, samples: Vec<MetricSample>) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.run(move |conn| {
            with_busy_retry(|| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO metrics (ts_ms, operation, duration_ms, ok, memory_delta, tags)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for sample in &samples {
                        let tags = serde_json::to_string(&sample.tags)?;
                        stmt.execute(params![
                            to_ms(sample.ts_start),
                            sample.operation,
                            sample.duration_ms as i64,
                            sample.ok,
                            sample.memory_delta,
                            tags,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
        })
        .await
    }

    /// Age-based retention sweep: removes posts and users scraped before
    /// `before`, their orphaned session associations, and old metric
    /// samples.
    pub async fn gc(&self, before: DateTime<Utc>) -> Result<GcStats, StoreError> {
        self.run(move |conn| {
            with_busy_retry(|| {
                let cutoff = to_ms(before);
                let tx = conn.transaction()?;
                let posts_deleted =
                    tx.execute("DELETE FROM posts WHERE scraped_at_ms < ?1", params![cutoff])?;
                tx.execute(
                    "DELETE FROM post_by_session
                     WHERE post_id NOT IN (SELECT id FROM posts)",
                    [],
                )?;
                let users_deleted =
                    tx.execute("DELETE FROM users WHERE scraped_at_ms < ?1", params![cutoff])?;
                let metrics_deleted =
                    tx.execute("DELETE FROM metrics WHERE ts_ms < ?1", params![cutoff])?;
                tx.commit()?;
                Ok(GcStats {
                    posts_deleted,
                    users_deleted,
                    metrics_deleted,
                })
            })
        })
        .await
    }

    /// Row counts and on-disk size for the stats endpoint.
    pub async fn stats(&self) -> Result<DatabaseStats, StoreError> {
        let path = self.path().to_path_buf();
        self.run(move |conn| {
            let count = |sql: &str| -> Result<u64, StoreError> {
                Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
            };
            let mut stats = DatabaseStats {
                posts: count("SELECT count(*) FROM posts")?,
                users: count("SELECT count(*) FROM users")?,
                sessions: count("SELECT count(*) FROM sessions")?,
                metrics: count("SELECT count(*) FROM metrics")?,
                ..DatabaseStats::default()
            };
            let mut stmt =
                conn.prepare("SELECT status, count(*) FROM sessions GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (status, n) = row?;
                stats.sessions_by_status.insert(status, n);
            }
            stats.file_size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{Page, PostFilter};
    use crate::StoreConfig;
    use chrono::Duration as ChronoDuration;
    use snooscope_core::{Session, SessionOptions};

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db"), StoreConfig::default()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn metrics_append_and_count() {
        let (_dir, store) = open_store().await;
        let samples = (0..3)
            .map(|i| {
                MetricSample::new(format!("op{i}"), Utc::now(), 12, true)
                    .tag("subreddit", "rust")
            })
            .collect();
        store.record_metrics(samples).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.metrics, 3);
        assert!(stats.file_size_bytes > 0);
    }

    #[tokio::test]
    async fn gc_trims_by_age() {
        let (_dir, store) = open_store().await;
        let session = Session::new(vec!["rust".into()], SessionOptions::default());
        let sid = session.session_id;
        store.create_session(session).await.unwrap();

        let old = Utc::now() - ChronoDuration::days(60);
        let mut old_post = crate::queries::posts::tests::test_post("old", "rust", 1, 1);
        old_post.scraped_at = old;
        let fresh_post = crate::queries::posts::tests::test_post("fresh", "rust", 1, 2);
        store
            .upsert_posts(vec![old_post, fresh_post], sid)
            .await
            .unwrap();
        store
            .record_metric(MetricSample::new("op", old, 5, true))
            .await
            .unwrap();

        let swept = store.gc(Utc::now() - ChronoDuration::days(30)).await.unwrap();
        assert_eq!(swept.posts_deleted, 1);
        assert_eq!(swept.metrics_deleted, 1);

        let (posts, total) = store
            .query_posts(PostFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(posts[0].id, "fresh");
        // the association for the swept post is gone too
        assert_eq!(store.session_post_ids(sid).await.unwrap(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn stats_group_sessions_by_status() {
        let (_dir, store) = open_store().await;
        store
            .create_session(Session::new(vec!["a".into()], SessionOptions::default()))
            .await
            .unwrap();
        store
            .create_session(Session::new(vec!["b".into()], SessionOptions::default()))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.sessions_by_status.get("queued"), Some(&2));
    }
}
