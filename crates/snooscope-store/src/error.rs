use snooscope_core::ScrapeError;
use thiserror::Error;

/// Errors surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Write contention outlasted the retry budget. Transient for
    /// callers.
    #[error("store busy")]
    Busy,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("row encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The file or its contents are beyond retry.
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True when the operation may be retried by the caller.
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy)
    }
}

impl From<StoreError> for ScrapeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy => ScrapeError::StoreBusy,
            other => ScrapeError::fatal(format!("store: {other}")),
        }
    }
}

/// True for the SQLite error codes produced by lock contention.
pub(crate) fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}
