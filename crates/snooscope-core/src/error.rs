//! The failure taxonomy every snooscope component classifies into.
//!
//! The variants map one-to-one onto retry semantics: callers branch on
//! [`ScrapeError::is_transient`] and friends instead of matching component
//! error types. Component crates convert into this type at their boundary,
//! so composing the fetch pipeline needs no per-layer `From` boilerplate.

use std::time::Duration;
use thiserror::Error;

/// Unified error for the scraping runtime.
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    /// Retryable at the caller's discretion: HTTP timeouts, 5xx, I/O.
    #[error("transient: {message}")]
    Transient { message: String },

    /// The remote asked us to slow down (HTTP 429). Retryable after the
    /// admission controller has been informed.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// A circuit breaker is refusing calls to `endpoint`. Retryable once
    /// the circuit re-closes; does not consume admission.
    #[error("circuit open for {endpoint}")]
    CircuitOpen { endpoint: String },

    /// The store could not take the write within its busy budget.
    #[error("store busy")]
    StoreBusy,

    /// Not retryable: 4xx (other than 429), auth misconfiguration, schema
    /// violations.
    #[error("permanent: {message}")]
    Permanent { message: String },

    /// The named thing does not exist (or is gone) upstream.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Item-level malformed data; the surrounding batch continues.
    #[error("skipped: {message}")]
    Skipped { message: String },

    /// Caller-initiated stop or deadline.
    #[error("cancelled")]
    Cancelled,

    /// Invariant broken; propagates to process shutdown.
    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl ScrapeError {
    pub fn transient(message: impl Into<String>) -> Self {
        ScrapeError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ScrapeError::Permanent {
            message: message.into(),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        ScrapeError::Skipped {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ScrapeError::Fatal {
            message: message.into(),
        }
    }

    /// True for errors a worker may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScrapeError::Transient { .. }
                | ScrapeError::RateLimited { .. }
                | ScrapeError::CircuitOpen { .. }
                | ScrapeError::StoreBusy
        )
    }

    /// True for errors that advance to the next unit of work instead of
    /// retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ScrapeError::Permanent { .. } | ScrapeError::NotFound { .. }
        )
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ScrapeError::Skipped { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScrapeError::Cancelled)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ScrapeError::Fatal { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ScrapeError::CircuitOpen { .. })
    }
}
