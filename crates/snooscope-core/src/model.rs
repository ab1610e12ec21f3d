//! Canonical post and user records.
//!
//! These are the shapes the forum client parses into and the store
//! persists. Derived fields (`category`, `engagement_ratio`) are computed
//! here so the client and tests share one definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a post's body is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Link,
    Image,
    Video,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Link => "link",
            ContentType::Image => "image",
            ContentType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentType::Text),
            "link" => Some(ContentType::Link),
            "image" => Some(ContentType::Image),
            "video" => Some(ContentType::Video),
            _ => None,
        }
    }
}

/// Listing sort order, matching the forum API's path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    Hot,
    New,
    Top,
    Rising,
}

impl Sort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sort::Hot => "hot",
            Sort::New => "new",
            Sort::Top => "top",
            Sort::Rising => "rising",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hot" => Some(Sort::Hot),
            "new" => Some(Sort::New),
            "top" => Some(Sort::Top),
            "rising" => Some(Sort::Rising),
            _ => None,
        }
    }
}

impl Default for Sort {
    fn default() -> Self {
        Sort::Hot
    }
}

/// Window applied to `top`-style listings, matching the API's `t` query
/// parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(TimeFilter::Hour),
            "day" => Some(TimeFilter::Day),
            "week" => Some(TimeFilter::Week),
            "month" => Some(TimeFilter::Month),
            "year" => Some(TimeFilter::Year),
            "all" => Some(TimeFilter::All),
            _ => None,
        }
    }
}

impl Default for TimeFilter {
    fn default() -> Self {
        TimeFilter::Day
    }
}

/// Metadata extracted from an external link target by the content
/// enricher. Every field is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub snippet: Option<String>,
    pub published_at: Option<String>,
}

impl LinkPreview {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.author.is_none()
            && self.snippet.is_none()
            && self.published_at.is_none()
    }
}

/// A canonical forum post.
///
/// `id` is the forum's opaque identifier and the primary key in the store.
/// Re-fetching the same id upserts: scalars are overwritten, the earliest
/// `scraped_at` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub subreddit: String,
    pub score: i64,
    pub upvote_ratio: f64,
    pub num_comments: i64,
    pub created_utc: i64,
    pub url: String,
    pub permalink: String,
    pub selftext: String,
    pub link_url: Option<String>,
    pub flair: Option<String>,
    pub is_nsfw: bool,
    pub is_spoiler: bool,
    pub is_self: bool,
    pub domain: String,
    pub content_type: ContentType,
    pub scraped_at: DateTime<Utc>,
    pub category: String,
    pub engagement_ratio: f64,
    pub sentiment_score: Option<f64>,
    pub viral_potential: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_preview: Option<LinkPreview>,
}

impl Post {
    /// Comments per point of score. High values flag discussion-heavy
    /// posts regardless of absolute reach.
    pub fn compute_engagement_ratio(score: i64, num_comments: i64) -> f64 {
        num_comments as f64 / score.max(1) as f64
    }

    /// Buckets a post by flair first, title keywords second.
    pub fn derive_category(title: &str, flair: Option<&str>, is_self: bool) -> String {
        if let Some(flair) = flair {
            let f = flair.to_lowercase();
            for known in ["news", "discussion", "question", "meme", "guide"] {
                if f.contains(known) {
                    return known.to_string();
                }
            }
        }
        let t = title.to_lowercase();
        if t.ends_with('?')
            || t.starts_with("how ")
            || t.starts_with("why ")
            || t.starts_with("what ")
        {
            "question".to_string()
        } else if t.contains("announc") || t.contains("release") || t.contains("breaking") {
            "news".to_string()
        } else if t.contains("guide") || t.contains("tutorial") || t.contains("how to") {
            "guide".to_string()
        } else if is_self {
            "discussion".to_string()
        } else {
            "other".to_string()
        }
    }

    /// Fills the derived fields from the raw ones. Called once at parse
    /// time; safe to call again after a scalar update.
    pub fn refresh_derived(&mut self) {
        self.engagement_ratio = Self::compute_engagement_ratio(self.score, self.num_comments);
        self.category =
            Self::derive_category(&self.title, self.flair.as_deref(), self.is_self);
    }
}

/// A forum user profile, keyed by username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub id: String,
    pub created_utc: i64,
    pub comment_karma: i64,
    pub link_karma: i64,
    pub is_verified: bool,
    pub has_premium: bool,
    pub profile_description: String,
    pub scraped_at: DateTime<Utc>,
}
