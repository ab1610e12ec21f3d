//! Canonicalization of raw forum JSON into the snooscope domain model.
//!
//! Parsing is strict about identity (a post without an id is skipped) and
//! lenient about everything else: missing scalars default rather than
//! sinking the batch.

use chrono::Utc;
use serde_json::Value;
use snooscope_core::{ContentType, Post, ScrapeError, User};

/// A parsed listing page.
#[derive(Debug)]
pub struct ParsedListing {
    pub posts: Vec<Post>,
    pub after: Option<String>,
    /// Children that failed to canonicalize and were skipped.
    pub skipped: usize,
}

/// Parses one listing page. Malformed children are counted and skipped;
/// a response that is not a listing at all is a permanent error.
pub fn parse_listing(value: &Value) -> Result<ParsedListing, ScrapeError> {
    let children = value
        .pointer("/data/children")
        .and_then(Value::as_array)
        .ok_or_else(|| ScrapeError::permanent("response is not a listing"))?;

    let mut posts = Vec::with_capacity(children.len());
    let mut skipped = 0usize;
    for child in children {
        if child.get("kind").and_then(Value::as_str) != Some("t3") {
            continue;
        }
        let Some(data) = child.get("data") else {
            skipped += 1;
            continue;
        };
        match parse_post(data) {
            Ok(post) => posts.push(post),
            Err(err) => {
                skipped += 1;
                tracing::debug!(%err, "skipping malformed listing child");
            }
        }
    }

    let after = value
        .pointer("/data/after")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(ParsedListing {
        posts,
        after,
        skipped,
    })
}

/// Canonicalizes one `t3` record.
pub fn parse_post(data: &Value) -> Result<Post, ScrapeError> {
    let id = str_field(data, "id")
        .ok_or_else(|| ScrapeError::skipped("post without id"))?
        .to_string();
    let title = str_field(data, "title")
        .ok_or_else(|| ScrapeError::skipped(format!("post {id} without title")))?
        .to_string();
    let subreddit = str_field(data, "subreddit")
        .ok_or_else(|| ScrapeError::skipped(format!("post {id} without subreddit")))?
        .to_string();

    let author = str_field(data, "author")
        .filter(|a| !a.is_empty() && *a != "[deleted]")
        .map(str::to_string);
    let score = int_field(data, "score");
    let num_comments = int_field(data, "num_comments");
    let upvote_ratio = data
        .get("upvote_ratio")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let created_utc = data
        .get("created_utc")
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as i64;

    let url = str_field(data, "url").unwrap_or_default().to_string();
    let permalink = str_field(data, "permalink").unwrap_or_default().to_string();
    let selftext = str_field(data, "selftext").unwrap_or_default().to_string();
    let flair = str_field(data, "link_flair_text")
        .filter(|f| !f.is_empty())
        .map(str::to_string);
    let is_nsfw = bool_field(data, "over_18");
    let is_spoiler = bool_field(data, "spoiler");
    let is_self = bool_field(data, "is_self");
    let is_video = bool_field(data, "is_video");
    let domain = str_field(data, "domain").unwrap_or_default().to_string();
    let post_hint = str_field(data, "post_hint");

    let content_type = infer_content_type(is_self, is_video, post_hint, &url);
    let link_url = (!is_self && !url.is_empty()).then(|| url.clone());

    let mut post = Post {
        id,
        title,
        author,
        subreddit,
        score,
        upvote_ratio,
        num_comments,
        created_utc,
        url,
        permalink,
        selftext,
        link_url,
        flair,
        is_nsfw,
        is_spoiler,
        is_self,
        domain,
        content_type,
        scraped_at: Utc::now(),
        category: String::new(),
        engagement_ratio: 0.0,
        sentiment_score: None,
        viral_potential: None,
        link_preview: None,
    };
    post.refresh_derived();
    Ok(post)
}

/// Canonicalizes a `t2` user record from the about endpoint.
pub fn parse_user(value: &Value) -> Result<User, ScrapeError> {
    let data = value
        .get("data")
        .ok_or_else(|| ScrapeError::skipped("user response without data"))?;
    let username = str_field(data, "name")
        .ok_or_else(|| ScrapeError::skipped("user without name"))?
        .to_string();
    Ok(User {
        id: str_field(data, "id").unwrap_or_default().to_string(),
        created_utc: data
            .get("created_utc")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as i64,
        comment_karma: int_field(data, "comment_karma"),
        link_karma: int_field(data, "link_karma"),
        is_verified: bool_field(data, "verified"),
        has_premium: bool_field(data, "is_gold"),
        profile_description: data
            .pointer("/subreddit/public_description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        scraped_at: Utc::now(),
        username,
    })
}

fn infer_content_type(
    is_self: bool,
    is_video: bool,
    post_hint: Option<&str>,
    url: &str,
) -> ContentType {
    if is_video || matches!(post_hint, Some("hosted:video" | "rich:video")) {
        return ContentType::Video;
    }
    let image_url = [".png", ".jpg", ".jpeg", ".gif", ".webp"]
        .iter()
        .any(|ext| url.to_lowercase().ends_with(ext));
    if matches!(post_hint, Some("image")) || image_url {
        return ContentType::Image;
    }
    if is_self {
        return ContentType::Text;
    }
    ContentType::Link
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn int_field(data: &Value, key: &str) -> i64 {
    data.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn bool_field(data: &Value, key: &str) -> bool {
    data.get(key).and_then(Value::as_bool).unwrap_or(false)
}
