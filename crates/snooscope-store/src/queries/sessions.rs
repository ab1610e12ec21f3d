//! Session rows: creation, patching, and restore-on-boot queries.
//!
//! The session engine is the only caller that mutates these rows (the
//! batch upserts bump counters, nothing else). Patches are partial on
//! purpose: the engine never rewrites counters wholesale, so a patch can
//! race a batch commit without losing either side's update.

use crate::error::StoreError;
use crate::queries::{SessionFilter, SessionPatch};
use crate::retry::with_busy_retry;
use crate::schema::{from_ms, to_ms};
use crate::Store;
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use snooscope_core::{Session, SessionStatus};
use uuid::Uuid;

/// Shape of the `counters` JSON column.
#[derive(Debug, Serialize, Deserialize)]
struct Counters {
    posts_scraped: u64,
    users_scraped: u64,
    errors: u64,
    progress: f64,
}

impl Store {
    /// Persists a new session row. The plan goes down atomically with
    /// the rest of the row.
    pub async fn create_session(&self, session: Session) -> Result<(), StoreError> {
        self.run(move |conn| {
            let counters = serde_json::to_string(&Counters {
                posts_scraped: session.posts_scraped,
                users_scraped: session.users_scraped,
                errors: session.errors,
                progress: session.progress,
            })?;
            let subreddits = serde_json::to_string(&session.subreddits)?;
            let plan = serde_json::to_string(&session.plan)?;
            let options = serde_json::to_string(&session.options)?;
            with_busy_retry(|| {
                conn.execute(
                    "INSERT INTO sessions (
                        session_id, status, subreddits, plan, counters, options,
                        start_time_ms, end_time_ms, error_message, last_heartbeat_ms
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        session.session_id.to_string(),
                        session.status.as_str(),
                        subreddits,
                        plan,
                        counters,
                        options,
                        to_ms(session.start_time),
                        session.end_time.map(to_ms),
                        session.error_message,
                        to_ms(session.last_heartbeat),
                    ],
                )?;
                Ok(())
            })
        })
        .await
    }

    /// Applies a partial update to one session row.
    pub async fn update_session(
        &self,
        session_id: Uuid,
        patch: SessionPatch,
    ) -> Result<(), StoreError> {
        self.run(move |conn| {
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Value> = Vec::new();

            if let Some(status) = patch.status {
                values.push(Value::Text(status.as_str().to_string()));
                sets.push(format!("status = ?{}", values.len()));
            }
            if let Some(plan) = &patch.plan {
                values.push(Value::Text(serde_json::to_string(plan)?));
                sets.push(format!("plan = ?{}", values.len()));
            }

            let mut counter_paths: Vec<String> = Vec::new();
            if let Some(progress) = patch.progress {
                values.push(Value::Real(progress));
                counter_paths.push(format!("'$.progress', ?{}", values.len()));
            }
            if let Some(errors) = patch.errors {
                values.push(Value::Integer(errors as i64));
                counter_paths.push(format!("'$.errors', ?{}", values.len()));
            }
            if !counter_paths.is_empty() {
                sets.push(format!(
                    "counters = json_set(counters, {})",
                    counter_paths.join(", ")
                ));
            }

            if let Some(end_time) = patch.end_time {
                match end_time {
                    Some(t) => values.push(Value::Integer(to_ms(t))),
                    None => values.push(Value::Null),
                }
                sets.push(format!("end_time_ms = ?{}", values.len()));
            }
            if let Some(error_message) = &patch.error_message {
                match error_message {
                    Some(m) => values.push(Value::Text(m.clone())),
                    None => values.push(Value::Null),
                }
                sets.push(format!("error_message = ?{}", values.len()));
            }
            if let Some(heartbeat) = patch.last_heartbeat {
                values.push(Value::Integer(to_ms(heartbeat)));
                sets.push(format!("last_heartbeat_ms = ?{}", values.len()));
            }

            if sets.is_empty() {
                return Ok(());
            }
            values.push(Value::Text(session_id.to_string()));
            let sql = format!(
                "UPDATE sessions SET {} WHERE session_id = ?{}",
                sets.join(", "),
                values.len()
            );
            with_busy_retry(|| {
                conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
                Ok(())
            })
        })
        .await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        self.run(move |conn| {
            let session = conn
                .query_row(
                    "SELECT * FROM sessions WHERE session_id = ?1",
                    params![session_id.to_string()],
                    session_from_row,
                )
                .optional()?;
            Ok(session)
        })
        .await
    }

    /// Sessions, most recent first.
    pub async fn list_sessions(
        &self,
        filter: SessionFilter,
    ) -> Result<Vec<Session>, StoreError> {
        self.run(move |conn| {
            let limit = filter.limit.unwrap_or(100).min(1000);
            let sessions = match filter.status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sessions WHERE status = ?1
                         ORDER BY start_time_ms DESC LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![status.as_str(), limit], session_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sessions ORDER BY start_time_ms DESC LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![limit], session_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(sessions)
        })
        .await
    }

    /// Sessions to re-materialize after a process restart.
    pub async fn load_active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM sessions
                 WHERE status IN ('queued', 'running', 'stopping')
                 ORDER BY start_time_ms ASC",
            )?;
            let sessions = stmt
                .query_map([], session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
        .await
    }

    /// Removes a session row and its post associations.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        self.run(move |conn| {
            with_busy_retry(|| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM post_by_session WHERE session_id = ?1",
                    params![session_id.to_string()],
                )?;
                let deleted = tx.execute(
                    "DELETE FROM sessions WHERE session_id = ?1",
                    params![session_id.to_string()],
                )?;
                tx.commit()?;
                Ok(deleted > 0)
            })
        })
        .await
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let parse = |field: &'static str, raw: String| -> rusqlite::Result<serde_json::Value> {
        serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{field}: {e}"),
                )),
            )
        })
    };

    let session_id: String = row.get("session_id")?;
    let status: String = row.get("status")?;
    let subreddits = parse("subreddits", row.get("subreddits")?)?;
    let plan = parse("plan", row.get("plan")?)?;
    let counters = parse("counters", row.get("counters")?)?;
    let options = parse("options", row.get("options")?)?;

    let invalid = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                what.to_string(),
            )),
        )
    };

    let end_time: Option<i64> = row.get("end_time_ms")?;
    Ok(Session {
        session_id: session_id
            .parse()
            .map_err(|_| invalid("session_id is not a uuid"))?,
        status: SessionStatus::parse(&status).ok_or_else(|| invalid("unknown status"))?,
        subreddits: serde_json::from_value(subreddits)
            .map_err(|_| invalid("subreddits column"))?,
        plan: serde_json::from_value(plan).map_err(|_| invalid("plan column"))?,
        posts_scraped: counters["posts_scraped"].as_u64().unwrap_or(0),
        users_scraped: counters["users_scraped"].as_u64().unwrap_or(0),
        errors: counters["errors"].as_u64().unwrap_or(0),
        progress: counters["progress"].as_f64().unwrap_or(0.0),
        options: serde_json::from_value(options).map_err(|_| invalid("options column"))?,
        start_time: from_ms(row.get("start_time_ms")?),
        end_time: end_time.map(from_ms),
        error_message: row.get("error_message")?,
        last_heartbeat: from_ms(row.get("last_heartbeat_ms")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;
    use chrono::Utc;
    use snooscope_core::SessionOptions;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db"), StoreConfig::default()).unwrap();
        (dir, store)
    }

    fn new_session(subreddits: &[&str]) -> Session {
        Session::new(
            subreddits.iter().map(|s| s.to_string()).collect(),
            SessionOptions {
                posts_per_subreddit: 10,
                ..SessionOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let (_dir, store) = open_store().await;
        let session = new_session(&["rust", "python"]);
        let id = session.session_id;
        store.create_session(session.clone()).await.unwrap();

        let loaded = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(loaded.subreddits, session.subreddits);
        assert_eq!(loaded.plan.len(), 2);
        assert_eq!(loaded.status, SessionStatus::Queued);
        assert_eq!(loaded.options.posts_per_subreddit, 10);
        assert_eq!(
            loaded.start_time.timestamp_millis(),
            session.start_time.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn patch_updates_only_named_fields() {
        let (_dir, store) = open_store().await;
        let session = new_session(&["rust"]);
        let id = session.session_id;
        store.create_session(session).await.unwrap();

        store
            .update_session(
                id,
                SessionPatch {
                    status: Some(SessionStatus::Running),
                    progress: Some(40.0),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.progress, 40.0);
        // untouched fields survive
        assert_eq!(loaded.posts_scraped, 0);
        assert!(loaded.end_time.is_none());
    }

    #[tokio::test]
    async fn terminal_patch_sets_end_time_and_message() {
        let (_dir, store) = open_store().await;
        let session = new_session(&["rust"]);
        let id = session.session_id;
        store.create_session(session).await.unwrap();

        let ended = Utc::now();
        store
            .update_session(
                id,
                SessionPatch {
                    status: Some(SessionStatus::Failed),
                    end_time: Some(Some(ended)),
                    error_message: Some(Some("heartbeat timeout".into())),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("heartbeat timeout"));
        assert_eq!(
            loaded.end_time.unwrap().timestamp_millis(),
            ended.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (_dir, store) = open_store().await;
        let a = new_session(&["rust"]);
        let b = new_session(&["python"]);
        let b_id = b.session_id;
        store.create_session(a).await.unwrap();
        store.create_session(b).await.unwrap();
        store
            .update_session(
                b_id,
                SessionPatch {
                    status: Some(SessionStatus::Completed),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        let queued = store
            .list_sessions(SessionFilter {
                status: Some(SessionStatus::Queued),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);

        let all = store.list_sessions(SessionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn load_active_skips_terminal_sessions() {
        let (_dir, store) = open_store().await;
        let a = new_session(&["rust"]);
        let a_id = a.session_id;
        let b = new_session(&["python"]);
        store.create_session(a).await.unwrap();
        store.create_session(b).await.unwrap();
        store
            .update_session(
                a_id,
                SessionPatch {
                    status: Some(SessionStatus::Cancelled),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();

        let active = store.load_active_sessions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, SessionStatus::Queued);
    }

    #[tokio::test]
    async fn delete_removes_row_and_associations() {
        let (_dir, store) = open_store().await;
        let session = new_session(&["rust"]);
        let id = session.session_id;
        store.create_session(session).await.unwrap();

        assert!(store.delete_session(id).await.unwrap());
        assert!(store.get_session(id).await.unwrap().is_none());
        assert!(!store.delete_session(id).await.unwrap());
    }

    #[tokio::test]
    async fn plan_patch_persists_observed_counts() {
        let (_dir, store) = open_store().await;
        let mut session = new_session(&["rust"]);
        let id = session.session_id;
        store.create_session(session.clone()).await.unwrap();

        session.plan[0].observed = 7;
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

        let loaded = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(loaded.plan[0].observed, 7);
    }
}
