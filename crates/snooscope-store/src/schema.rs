//! Table definitions and timestamp helpers.

use crate::error::StoreError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS posts (
    id               TEXT PRIMARY KEY,
    title            TEXT NOT NULL,
    author           TEXT,
    subreddit        TEXT NOT NULL,
    score            INTEGER NOT NULL DEFAULT 0,
    upvote_ratio     REAL NOT NULL DEFAULT 0,
    num_comments     INTEGER NOT NULL DEFAULT 0,
    created_utc      INTEGER NOT NULL DEFAULT 0,
    url              TEXT NOT NULL DEFAULT '',
    permalink        TEXT NOT NULL DEFAULT '',
    selftext         TEXT NOT NULL DEFAULT '',
    link_url         TEXT,
    flair            TEXT,
    is_nsfw          INTEGER NOT NULL DEFAULT 0,
    is_spoiler       INTEGER NOT NULL DEFAULT 0,
    is_self          INTEGER NOT NULL DEFAULT 0,
    domain           TEXT NOT NULL DEFAULT '',
    content_type     TEXT NOT NULL DEFAULT 'link',
    scraped_at_ms    INTEGER NOT NULL,
    category         TEXT NOT NULL DEFAULT '',
    engagement_ratio REAL NOT NULL DEFAULT 0,
    sentiment_score  REAL,
    viral_potential  REAL,
    link_preview     TEXT
);

CREATE INDEX IF NOT EXISTS idx_posts_created_utc ON posts(created_utc);
CREATE INDEX IF NOT EXISTS idx_posts_subreddit   ON posts(subreddit);
CREATE INDEX IF NOT EXISTS idx_posts_score       ON posts(score);

CREATE TABLE IF NOT EXISTS users (
    username            TEXT PRIMARY KEY,
    id                  TEXT NOT NULL DEFAULT '',
    created_utc         INTEGER NOT NULL DEFAULT 0,
    comment_karma       INTEGER NOT NULL DEFAULT 0,
    link_karma          INTEGER NOT NULL DEFAULT 0,
    is_verified         INTEGER NOT NULL DEFAULT 0,
    has_premium         INTEGER NOT NULL DEFAULT 0,
    profile_description TEXT NOT NULL DEFAULT '',
    scraped_at_ms       INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id      TEXT PRIMARY KEY,
    status          TEXT NOT NULL,
    subreddits      TEXT NOT NULL,
    plan            TEXT NOT NULL,
    counters        TEXT NOT NULL,
    options         TEXT NOT NULL,
    start_time_ms   INTEGER NOT NULL,
    end_time_ms     INTEGER,
    error_message   TEXT,
    last_heartbeat_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_status_start ON sessions(status, start_time_ms);

CREATE TABLE IF NOT EXISTS metrics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms       INTEGER NOT NULL,
    operation   TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    ok          INTEGER NOT NULL,
    memory_delta INTEGER NOT NULL DEFAULT 0,
    tags        TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics(ts_ms);

CREATE TABLE IF NOT EXISTS post_by_session (
    session_id TEXT NOT NULL,
    post_id    TEXT NOT NULL,
    PRIMARY KEY (session_id, post_id)
);
";

pub(crate) fn init(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Wallclock to the millisecond column encoding.
pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Millisecond column back to wallclock; out-of-range values collapse to
/// the epoch rather than poisoning the row.
pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        init(&mut conn).unwrap();
        init(&mut conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('posts', 'users', 'sessions', 'metrics', 'post_by_session')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn timestamps_round_trip_at_millisecond_precision() {
        let now = Utc::now();
        let back = from_ms(to_ms(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
