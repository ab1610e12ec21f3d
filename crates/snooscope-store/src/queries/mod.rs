//! Query surfaces, one module per table family.

pub mod metrics;
pub mod posts;
pub mod sessions;
pub mod users;

use chrono::{DateTime, Utc};
use snooscope_core::{PlanEntry, SessionStatus};
use std::collections::BTreeMap;

/// Result of one batched upsert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    /// Rows written (inserted or updated).
    pub written: usize,
    /// Rows newly attributed to the session; this is the delta applied
    /// to the session counter.
    pub new_for_session: usize,
}

/// Filters for [`Store::query_posts`](crate::Store::query_posts).
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub subreddit: Option<String>,
    pub min_score: Option<i64>,
    pub days_back: Option<u32>,
    /// Case-insensitive substring match on the title.
    pub search: Option<String>,
}

/// Stable pagination window.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: u32,
    pub offset: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Filters for session listing.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub limit: Option<u32>,
}

/// Partial session update. `None` fields are left untouched; the
/// double-`Option` fields distinguish "don't touch" from "set to null".
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub plan: Option<Vec<PlanEntry>>,
    pub progress: Option<f64>,
    pub errors: Option<u64>,
    pub end_time: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Counter and size view for the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct DatabaseStats {
    pub posts: u64,
    pub users: u64,
    pub sessions: u64,
    pub metrics: u64,
    pub sessions_by_status: BTreeMap<String, u64>,
    pub file_size_bytes: u64,
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GcStats {
    pub posts_deleted: usize,
    pub users_deleted: usize,
    pub metrics_deleted: usize,
}
