//! HTTP surface of the control API.

use crate::error::ApiError;
use crate::ws;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use snooscope_core::{EventBus, SessionOptions, SessionView, Sort, TimeFilter};
use snooscope_engine::SessionEngine;
use snooscope_store::{Page, PostFilter, SessionFilter, Store};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: SessionEngine,
    pub store: Store,
    pub bus: EventBus,
    pub config_view: serde_json::Value,
}

/// Builds the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config_view))
        .route("/scrape/start", post(start))
        .route("/scrape/status/{id}", get(status))
        .route("/scrape/sessions", get(sessions))
        .route("/scrape/stop/{id}", delete(stop))
        .route("/data/posts", get(posts))
        .route("/stats/database", get(stats))
        .route("/ws", get(ws::handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn config_view(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config_view.clone())
}

/// Body of `POST /scrape/start`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartRequest {
    pub subreddits: Vec<String>,
    pub posts_per_subreddit: u32,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub time_filter: Option<String>,
    #[serde(default)]
    pub include_users: bool,
    #[serde(default)]
    pub extract_content: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub min_score: Option<i64>,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub include_nsfw: bool,
}

impl StartRequest {
    /// Validates the request into session options.
    pub fn into_options(self) -> Result<(Vec<String>, SessionOptions), ApiError> {
        if self.subreddits.is_empty() {
            return Err(ApiError::Validation("subreddits must not be empty".into()));
        }
        if self.subreddits.iter().any(|s| s.trim().is_empty()) {
            return Err(ApiError::Validation(
                "subreddit names must not be blank".into(),
            ));
        }
        let sort = match self.sort.as_deref() {
            None => Sort::default(),
            Some(raw) => Sort::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown sort {raw:?}")))?,
        };
        let time_filter = match self.time_filter.as_deref() {
            None => TimeFilter::default(),
            Some(raw) => TimeFilter::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown time_filter {raw:?}")))?,
        };
        let max_workers = self.max_workers.unwrap_or(4);
        if max_workers == 0 {
            return Err(ApiError::Validation("max_workers must be at least 1".into()));
        }
        let options = SessionOptions {
            posts_per_subreddit: self.posts_per_subreddit,
            sort,
            time_filter,
            include_users: self.include_users,
            extract_content: self.extract_content,
            parallel: self.parallel,
            max_workers,
            min_score: self.min_score,
            max_age_days: self.max_age_days,
            include_nsfw: self.include_nsfw,
        };
        Ok((self.subreddits, options))
    }
}

async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (subreddits, options) = request.into_options()?;
    let session_id = state.engine.start(subreddits, options).await?;
    Ok(Json(serde_json::json!({ "session_id": session_id })))
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    match state.engine.status(id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(ApiError::NotFound(format!("session {id}"))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

async fn sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            snooscope_core::SessionStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown status {raw:?}")))
        })
        .transpose()?;
    let views = state
        .engine
        .list(SessionFilter {
            status,
            limit: query.limit,
        })
        .await?;
    Ok(Json(views))
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.engine.stop(id).await?;
    Ok(Json(serde_json::json!({
        "session_id": id,
        "status": status,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct PostsQuery {
    pub subreddit: Option<String>,
    pub min_score: Option<i64>,
    pub days_back: Option<u32>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

async fn posts(
    State(state): State<AppState>,
    Query(query): Query<PostsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = Page {
        limit: query.limit.unwrap_or(50),
        offset: query.offset.unwrap_or(0),
    };
    let filter = PostFilter {
        subreddit: query.subreddit,
        min_score: query.min_score,
        days_back: query.days_back,
        search: query.search,
    };
    let (posts, total) = state
        .store
        .query_posts(filter, page)
        .await
        .map_err(snooscope_core::ScrapeError::from)?;
    Ok(Json(serde_json::json!({
        "posts": posts,
        "total": total,
        "limit": page.limit,
        "offset": page.offset,
    })))
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state
        .store
        .stats()
        .await
        .map_err(snooscope_core::ScrapeError::from)?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(subreddits: &[&str]) -> StartRequest {
        StartRequest {
            subreddits: subreddits.iter().map(|s| s.to_string()).collect(),
            posts_per_subreddit: 10,
            sort: None,
            time_filter: None,
            include_users: false,
            extract_content: false,
            parallel: false,
            max_workers: None,
            min_score: None,
            max_age_days: None,
            include_nsfw: false,
        }
    }

    #[test]
    fn empty_subreddits_fail_validation() {
        let err = request(&[]).into_options().unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn blank_subreddit_fails_validation() {
        let err = request(&["rust", "  "]).into_options().unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn unknown_sort_fails_validation() {
        let mut req = request(&["rust"]);
        req.sort = Some("controversial".into());
        assert!(matches!(
            req.into_options().unwrap_err(),
            ApiError::Validation(_)
        ));
    }

    #[test]
    fn defaults_apply() {
        let (subreddits, options) = request(&["rust"]).into_options().unwrap();
        assert_eq!(subreddits, vec!["rust"]);
        assert_eq!(options.sort, Sort::Hot);
        assert_eq!(options.max_workers, 4);
        assert_eq!(options.posts_per_subreddit, 10);
    }

    #[test]
    fn zero_workers_rejected() {
        let mut req = request(&["rust"]);
        req.max_workers = Some(0);
        assert!(matches!(
            req.into_options().unwrap_err(),
            ApiError::Validation(_)
        ));
    }
}
