//! Session lifecycle and scheduling for snooscope.
//!
//! [`SessionEngine`] owns every session row: it validates and persists
//! new sessions, fans their plans across workers, coalesces progress
//! into bounded event streams, enforces error budgets, and restores
//! interrupted sessions after a restart. No other component mutates a
//! session.
//!
//! ```rust,no_run
//! use snooscope_core::{EventBus, SessionOptions};
//! use snooscope_engine::SessionEngine;
//! # async fn example(store: snooscope_store::Store, client: snooscope_client::RedditClient) {
//! let bus = EventBus::default();
//! let engine = SessionEngine::builder(store, bus, client).build();
//! engine.resume().await.unwrap();
//!
//! let id = engine
//!     .start(vec!["rust".into()], SessionOptions::default())
//!     .await
//!     .unwrap();
//! let view = engine.status(id).await.unwrap().unwrap();
//! # let _ = view;
//! # }
//! ```

pub mod analytics;
mod engine;
mod metrics;
mod scheduler;

pub use analytics::{
    Analytics, HeuristicViral, LexiconSentiment, SentimentScorer, TermFrequencyTrends,
    TrendAnalyzer, TrendSummary, ViralScorer,
};
pub use engine::{EngineConfig, SessionEngine, SessionEngineBuilder};
pub use metrics::MetricsBuffer;
