//! SQLite-backed persistence for snooscope.
//!
//! One on-disk file holds posts, users, sessions, metrics, and the
//! session/post association table. A connection pool hands WAL-mode
//! connections to callers; every write that touches posts or users also
//! updates the owning session's counters inside the same transaction, so
//! a crash can never strand counters ahead of (or behind) the data.
//!
//! Contended writes are retried with short jittered backoff; when the
//! budget is exhausted the caller sees [`StoreError::Busy`], which maps
//! into the transient side of the [`ScrapeError`] taxonomy.
//!
//! [`ScrapeError`]: snooscope_core::ScrapeError

mod error;
pub mod queries;
mod retry;
mod schema;

pub use error::StoreError;
pub use queries::{
    DatabaseStats, GcStats, Page, PostFilter, SessionFilter, SessionPatch, UpsertStats,
};

use r2d2_sqlite::SqliteConnectionManager;
use snooscope_core::EventBus;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pool and batching knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Pool size.
    pub max_connections: u32,
    /// Per-connection SQLite busy wait.
    pub busy_timeout: Duration,
    /// Posts/users per transaction.
    pub batch_size: usize,
    /// Leaked leases are reclaimed after this idle interval.
    pub idle_sweep: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            busy_timeout: Duration::from_secs(30),
            batch_size: 100,
            idle_sweep: Duration::from_secs(60),
        }
    }
}

/// Handle to the on-disk store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: r2d2::Pool<SqliteConnectionManager>,
    path: PathBuf,
    config: StoreConfig,
    bus: Option<EventBus>,
}

impl Store {
    /// Opens (creating if necessary) the store file and applies the
    /// schema.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let busy_timeout = config.busy_timeout;
        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });
        let pool = r2d2::Pool::builder()
            .max_size(config.max_connections)
            .idle_timeout(Some(config.idle_sweep))
            .build(manager)?;
        let mut conn = pool.get()?;
        schema::init(&mut conn)?;
        Ok(Self {
            pool,
            path,
            config,
            bus: None,
        })
    }

    /// Attaches the event bus; batch commits then publish `store_write`
    /// frames.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub(crate) fn pool(&self) -> r2d2::Pool<SqliteConnectionManager> {
        self.pool.clone()
    }

    pub(crate) fn bus(&self) -> Option<EventBus> {
        self.bus.clone()
    }

    /// Runs a blocking closure on the pool without starving the async
    /// runtime.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Corrupt(format!("store task failed: {e}")))?
    }
}
