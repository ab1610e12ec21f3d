//! User persistence.

use crate::error::StoreError;
use crate::queries::UpsertStats;
use crate::retry::with_busy_retry;
use crate::schema::{from_ms, to_ms};
use crate::Store;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use snooscope_core::{Event, User};
use uuid::Uuid;

impl Store {
    /// Upserts `users` in batches; each batch transaction also bumps the
    /// session's `users_scraped` counter by the number of profiles seen
    /// for the first time.
    pub async fn upsert_users(
        &self,
        users: Vec<User>,
        session_id: Uuid,
    ) -> Result<UpsertStats, StoreError> {
        if users.is_empty() {
            return Ok(UpsertStats::default());
        }
        let batch_size = self.batch_size();
        let bus = self.bus();
        let stats = self
            .run(move |conn| {
                let mut stats = UpsertStats::default();
                for chunk in users.chunks(batch_size) {
                    let chunk_stats =
                        with_busy_retry(|| upsert_chunk(conn, chunk, session_id))?;
                    stats.written += chunk_stats.written;
                    stats.new_for_session += chunk_stats.new_for_session;
                }
                Ok(stats)
            })
            .await?;

        if let Some(bus) = bus {
            bus.publish(Event::StoreWrite {
                session_id: Some(session_id),
                ts: Utc::now(),
                posts: 0,
                users: stats.written,
            });
        }
        Ok(stats)
    }

    /// Fetches one stored profile.
    pub async fn get_user(&self, username: String) -> Result<Option<User>, StoreError> {
        self.run(move |conn| {
            let user = conn
                .query_row(
                    "SELECT * FROM users WHERE username = ?1",
                    params![username],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }
}

fn upsert_chunk(
    conn: &mut Connection,
    chunk: &[User],
    session_id: Uuid,
) -> Result<UpsertStats, StoreError> {
    let tx = conn.transaction()?;
    let mut stats = UpsertStats::default();
    {
        let mut exists = tx.prepare_cached("SELECT 1 FROM users WHERE username = ?1")?;
        let mut upsert = tx.prepare_cached(
            "INSERT INTO users (
                username, id, created_utc, comment_karma, link_karma,
                is_verified, has_premium, profile_description, scraped_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(username) DO UPDATE SET
                id = excluded.id,
                created_utc = excluded.created_utc,
                comment_karma = excluded.comment_karma,
                link_karma = excluded.link_karma,
                is_verified = excluded.is_verified,
                has_premium = excluded.has_premium,
                profile_description = excluded.profile_description,
                scraped_at_ms = MIN(users.scraped_at_ms, excluded.scraped_at_ms)",
        )?;
        for user in chunk {
            let seen: Option<i64> = exists
                .query_row(params![user.username], |row| row.get(0))
                .optional()?;
            upsert.execute(params![
                user.username,
                user.id,
                user.created_utc,
                user.comment_karma,
                user.link_karma,
                user.is_verified,
                user.has_premium,
                user.profile_description,
                to_ms(user.scraped_at),
            ])?;
            stats.written += 1;
            if seen.is_none() {
                stats.new_for_session += 1;
            }
        }
    }
    if stats.new_for_session > 0 {
        tx.execute(
            "UPDATE sessions
             SET counters = json_set(
                 counters,
                 '$.users_scraped',
                 json_extract(counters, '$.users_scraped') + ?1
             )
             WHERE session_id = ?2",
            params![stats.new_for_session as i64, session_id.to_string()],
        )?;
    }
    tx.commit()?;
    Ok(stats)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        username: row.get("username")?,
        id: row.get("id")?,
        created_utc: row.get("created_utc")?,
        comment_karma: row.get("comment_karma")?,
        link_karma: row.get("link_karma")?,
        is_verified: row.get("is_verified")?,
        has_premium: row.get("has_premium")?,
        profile_description: row.get("profile_description")?,
        scraped_at: from_ms(row.get("scraped_at_ms")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;
    use snooscope_core::{Session, SessionOptions};

    fn test_user(name: &str, karma: i64) -> User {
        User {
            username: name.to_string(),
            id: format!("t2_{name}"),
            created_utc: 1_000_000,
            comment_karma: karma,
            link_karma: karma * 2,
            is_verified: false,
            has_premium: false,
            profile_description: String::new(),
            scraped_at: Utc::now(),
        }
    }

    async fn store_with_session() -> (tempfile::TempDir, Store, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db"), StoreConfig::default()).unwrap();
        let session = Session::new(vec!["rust".into()], SessionOptions::default());
        let id = session.session_id;
        store.create_session(session).await.unwrap();
        (dir, store, id)
    }

    #[tokio::test]
    async fn upserts_and_counts_first_sightings_only() {
        let (_dir, store, sid) = store_with_session().await;
        let stats = store
            .upsert_users(vec![test_user("alice", 10), test_user("bob", 20)], sid)
            .await
            .unwrap();
        assert_eq!(stats.new_for_session, 2);

        // second pass updates karma but adds nothing to the counter
        let stats = store
            .upsert_users(vec![test_user("alice", 99)], sid)
            .await
            .unwrap();
        assert_eq!(stats.written, 1);
        assert_eq!(stats.new_for_session, 0);

        let session = store.get_session(sid).await.unwrap().unwrap();
        assert_eq!(session.users_scraped, 2);

        let alice = store.get_user("alice".into()).await.unwrap().unwrap();
        assert_eq!(alice.comment_karma, 99);
    }

    #[tokio::test]
    async fn missing_user_is_none() {
        let (_dir, store, _sid) = store_with_session().await;
        assert!(store.get_user("ghost".into()).await.unwrap().is_none());
    }
}
