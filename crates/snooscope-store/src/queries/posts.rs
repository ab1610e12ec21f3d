//! Post persistence: batched upserts and the query surface.

use crate::error::StoreError;
use crate::queries::{Page, PostFilter, UpsertStats};
use crate::retry::with_busy_retry;
use crate::schema::{from_ms, to_ms};
use crate::Store;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, Row};
use snooscope_core::{ContentType, Event, Post};
use uuid::Uuid;

const UPSERT_POST: &str = "
INSERT INTO posts (
    id, title, author, subreddit, score, upvote_ratio, num_comments,
    created_utc, url, permalink, selftext, link_url, flair,
    is_nsfw, is_spoiler, is_self, domain, content_type, scraped_at_ms,
    category, engagement_ratio, sentiment_score, viral_potential, link_preview
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
    ?8, ?9, ?10, ?11, ?12, ?13,
    ?14, ?15, ?16, ?17, ?18, ?19,
    ?20, ?21, ?22, ?23, ?24
)
ON CONFLICT(id) DO UPDATE SET
    title = excluded.title,
    author = excluded.author,
    subreddit = excluded.subreddit,
    score = excluded.score,
    upvote_ratio = excluded.upvote_ratio,
    num_comments = excluded.num_comments,
    created_utc = excluded.created_utc,
    url = excluded.url,
    permalink = excluded.permalink,
    selftext = excluded.selftext,
    link_url = excluded.link_url,
    flair = excluded.flair,
    is_nsfw = excluded.is_nsfw,
    is_spoiler = excluded.is_spoiler,
    is_self = excluded.is_self,
    domain = excluded.domain,
    content_type = excluded.content_type,
    scraped_at_ms = MIN(posts.scraped_at_ms, excluded.scraped_at_ms),
    category = excluded.category,
    engagement_ratio = excluded.engagement_ratio,
    sentiment_score = COALESCE(excluded.sentiment_score, posts.sentiment_score),
    viral_potential = COALESCE(excluded.viral_potential, posts.viral_potential),
    link_preview = COALESCE(excluded.link_preview, posts.link_preview)
";

impl Store {
    /// Upserts `posts` in batches, attributing them to `session_id`.
    ///
    /// Each batch is one transaction that also bumps the session's
    /// `posts_scraped` counter by the number of posts newly associated
    /// with it, so data and counters can never drift apart.
    pub async fn upsert_posts(
        &self,
        posts: Vec<Post>,
        session_id: Uuid,
    ) -> Result<UpsertStats, StoreError> {
        if posts.is_empty() {
            return Ok(UpsertStats::default());
        }
        let batch_size = self.batch_size();
        let bus = self.bus();
        let stats = self
            .run(move |conn| {
                let mut stats = UpsertStats::default();
                for chunk in posts.chunks(batch_size) {
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
                posts: stats.written,
                users: 0,
            });
        }
        Ok(stats)
    }

    /// Filtered, stably ordered page of posts plus the total match count.
    pub async fn query_posts(
        &self,
        filter: PostFilter,
        page: Page,
    ) -> Result<(Vec<Post>, u64), StoreError> {
        self.run(move |conn| {
            let (where_sql, params) = build_filter(&filter);

            let total: u64 = conn.query_row(
                &format!("SELECT count(*) FROM posts {where_sql}"),
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT * FROM posts {where_sql}
                 ORDER BY created_utc DESC, id DESC
                 LIMIT {} OFFSET {}",
                page.limit.min(500),
                page.offset
            );
            let mut stmt = conn.prepare(&sql)?;
            let posts = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), post_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((posts, total))
        })
        .await
    }

    /// Post ids attributed to a session, for resumability audits.
    pub async fn session_post_ids(&self, session_id: Uuid) -> Result<Vec<String>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT post_id FROM post_by_session WHERE session_id = ?1 ORDER BY post_id",
            )?;
            let ids = stmt
                .query_map(params![session_id.to_string()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
        .await
    }
}

fn upsert_chunk(
    conn: &mut Connection,
    chunk: &[Post],
    session_id: Uuid,
) -> Result<UpsertStats, StoreError> {
    let tx = conn.transaction()?;
    let mut stats = UpsertStats::default();
    {
        let mut upsert = tx.prepare_cached(UPSERT_POST)?;
        let mut associate = tx.prepare_cached(
            "INSERT OR IGNORE INTO post_by_session (session_id, post_id) VALUES (?1, ?2)",
        )?;
        for post in chunk {
            let link_preview = post
                .link_preview
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            upsert.execute(params![
                post.id,
                post.title,
                post.author,
                post.subreddit,
                post.score,
                post.upvote_ratio,
                post.num_comments,
                post.created_utc,
                post.url,
                post.permalink,
                post.selftext,
                post.link_url,
                post.flair,
                post.is_nsfw,
                post.is_spoiler,
                post.is_self,
                post.domain,
                post.content_type.as_str(),
                to_ms(post.scraped_at),
                post.category,
                post.engagement_ratio,
                post.sentiment_score,
                post.viral_potential,
                link_preview,
            ])?;
            stats.written += 1;
            let newly =
                associate.execute(params![session_id.to_string(), post.id])?;
            stats.new_for_session += newly;
        }
    }
    if stats.new_for_session > 0 {
        tx.execute(
            "UPDATE sessions
             SET counters = json_set(
                 counters,
                 '$.posts_scraped',
                 json_extract(counters, '$.posts_scraped') + ?1
             )
             WHERE session_id = ?2",
            params![stats.new_for_session as i64, session_id.to_string()],
        )?;
    }
    tx.commit()?;
    Ok(stats)
}

fn build_filter(filter: &PostFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if let Some(subreddit) = &filter.subreddit {
        params.push(Value::Text(subreddit.clone()));
        clauses.push(format!("subreddit = ?{}", params.len()));
    }
    if let Some(min_score) = filter.min_score {
        params.push(Value::Integer(min_score));
        clauses.push(format!("score >= ?{}", params.len()));
    }
    if let Some(days_back) = filter.days_back {
        let cutoff = Utc::now().timestamp() - i64::from(days_back) * 86_400;
        params.push(Value::Integer(cutoff));
        clauses.push(format!("created_utc >= ?{}", params.len()));
    }
    if let Some(search) = &filter.search {
        params.push(Value::Text(search.to_lowercase()));
        clauses.push(format!("instr(lower(title), ?{}) > 0", params.len()));
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), params)
    }
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    let content_type: String = row.get("content_type")?;
    let link_preview: Option<String> = row.get("link_preview")?;
    Ok(Post {
        id: row.get("id")?,
        title: row.get("title")?,
        author: row.get("author")?,
        subreddit: row.get("subreddit")?,
        score: row.get("score")?,
        upvote_ratio: row.get("upvote_ratio")?,
        num_comments: row.get("num_comments")?,
        created_utc: row.get("created_utc")?,
        url: row.get("url")?,
        permalink: row.get("permalink")?,
        selftext: row.get("selftext")?,
        link_url: row.get("link_url")?,
        flair: row.get("flair")?,
        is_nsfw: row.get("is_nsfw")?,
        is_spoiler: row.get("is_spoiler")?,
        is_self: row.get("is_self")?,
        domain: row.get("domain")?,
        content_type: ContentType::parse(&content_type).unwrap_or(ContentType::Link),
        scraped_at: from_ms(row.get("scraped_at_ms")?),
        category: row.get("category")?,
        engagement_ratio: row.get("engagement_ratio")?,
        sentiment_score: row.get("sentiment_score")?,
        viral_potential: row.get("viral_potential")?,
        link_preview: link_preview.and_then(|s| serde_json::from_str(&s).ok()),
    })
}
