//! Session rows, plans, and metric samples.
//!
//! A session is the durable unit of scraping work. It is persisted before
//! any fetch happens and every transition is written to the store before
//! the matching event is published, which is what makes crash resume
//! possible.

use crate::model::{Sort, TimeFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle state of a scraping session.
///
/// ```text
/// queued -> running -> completed
///             |  \-> failed
///             \-> stopping -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Running,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(SessionStatus::Queued),
            "running" => Some(SessionStatus::Running),
            "stopping" => Some(SessionStatus::Stopping),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Active states are restored and re-driven after a process restart.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// One unit of planned work: scrape `target_count` posts from one
/// subreddit. `observed` tracks committed posts and survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub subreddit: String,
    pub target_count: u32,
    pub sort: Sort,
    pub time_filter: TimeFilter,
    #[serde(default)]
    pub observed: u32,
}

impl PlanEntry {
    pub fn is_done(&self) -> bool {
        self.observed >= self.target_count
    }

    /// Capacity left before the hard cap.
    pub fn remaining(&self) -> u32 {
        self.target_count.saturating_sub(self.observed)
    }
}

/// Caller-supplied knobs for a session, persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub posts_per_subreddit: u32,
    #[serde(default)]
    pub sort: Sort,
    #[serde(default)]
    pub time_filter: TimeFilter,
    #[serde(default)]
    pub include_users: bool,
    #[serde(default)]
    pub extract_content: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub min_score: Option<i64>,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub include_nsfw: bool,
}

fn default_max_workers() -> usize {
    4
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            posts_per_subreddit: 25,
            sort: Sort::default(),
            time_filter: TimeFilter::default(),
            include_users: false,
            extract_content: false,
            parallel: false,
            max_workers: default_max_workers(),
            min_score: None,
            max_age_days: None,
            include_nsfw: false,
        }
    }
}

/// A durable scraping session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub subreddits: Vec<String>,
    pub plan: Vec<PlanEntry>,
    pub status: SessionStatus,
    pub posts_scraped: u64,
    pub users_scraped: u64,
    pub errors: u64,
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub options: SessionOptions,
    pub last_heartbeat: DateTime<Utc>,
}

impl Session {
    /// Creates a queued session and expands its plan, one entry per
    /// subreddit with the shared target count.
    pub fn new(subreddits: Vec<String>, options: SessionOptions) -> Self {
        let now = Utc::now();
        let plan = subreddits
            .iter()
            .map(|s| PlanEntry {
                subreddit: s.clone(),
                target_count: options.posts_per_subreddit,
                sort: options.sort,
                time_filter: options.time_filter,
                observed: 0,
            })
            .collect();
        Self {
            session_id: Uuid::new_v4(),
            subreddits,
            plan,
            status: SessionStatus::Queued,
            posts_scraped: 0,
            users_scraped: 0,
            errors: 0,
            progress: 0.0,
            start_time: now,
            end_time: None,
            error_message: None,
            options,
            last_heartbeat: now,
        }
    }

    /// Progress over the plan, in [0, 100]. An empty or zero-target plan
    /// is complete by definition.
    pub fn compute_progress(plan: &[PlanEntry]) -> f64 {
        let total: u64 = plan.iter().map(|e| e.target_count as u64).sum();
        if total == 0 {
            return 100.0;
        }
        let observed: u64 = plan
            .iter()
            .map(|e| e.observed.min(e.target_count) as u64)
            .sum();
        (observed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Read-only projection for API consumers.
    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.session_id,
            subreddits: self.subreddits.clone(),
            status: self.status,
            posts_scraped: self.posts_scraped,
            users_scraped: self.users_scraped,
            errors: self.errors,
            progress: self.progress,
            start_time: self.start_time,
            end_time: self.end_time,
            error_message: self.error_message.clone(),
            plan: self
                .plan
                .iter()
                .map(|e| PlanProgress {
                    subreddit: e.subreddit.clone(),
                    target: e.target_count,
                    observed: e.observed.min(e.target_count),
                })
                .collect(),
        }
    }
}

/// Per-subreddit observed-vs-target breakdown inside a [`SessionView`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub subreddit: String,
    pub target: u32,
    pub observed: u32,
}

/// What the control API returns for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub subreddits: Vec<String>,
    pub status: SessionStatus,
    pub posts_scraped: u64,
    pub users_scraped: u64,
    pub errors: u64,
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub plan: Vec<PlanProgress>,
}

/// One timing observation, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub operation: String,
    pub ts_start: DateTime<Utc>,
    pub duration_ms: u64,
    pub ok: bool,
    #[serde(default)]
    pub memory_delta: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MetricSample {
    pub fn new(operation: impl Into<String>, ts_start: DateTime<Utc>, duration_ms: u64, ok: bool) -> Self {
        Self {
            operation: operation.into(),
            ts_start,
            duration_ms,
            ok,
            memory_delta: 0,
            tags: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
