use crate::adaptive::AdaptiveRate;
use crate::config::PacerConfig;
use crate::events::AdmissionEvent;
use crate::pacer::Outcome;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use snooscope_core::ScrapeError;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;

/// Process-shared admission token.
///
/// The last-grant timestamp lives in a `pacing` row inside the shared
/// store file, so every worker process pacing the same domain observes
/// one line. Wallclock time is used because `Instant` does not cross
/// process boundaries. The adaptive outcome window stays per-process;
/// only the grant timestamp is shared.
#[derive(Clone)]
pub struct SharedPacer {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    conn: Mutex<Connection>,
    adaptive: Mutex<AdaptiveRate>,
    config: PacerConfig,
}

impl SharedPacer {
    pub(crate) fn open(path: &Path, config: PacerConfig) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pacing (
                domain TEXT PRIMARY KEY,
                last_grant_us INTEGER NOT NULL
            )",
            [],
        )?;
        let adaptive = AdaptiveRate::new(
            config.rate,
            config.min_rate,
            config.max_rate,
            config.window_size,
        );
        Ok(Self {
            inner: Arc::new(SharedInner {
                conn: Mutex::new(conn),
                adaptive: Mutex::new(adaptive),
                config,
            }),
        })
    }

    /// Waits for the next shared slot and consumes it.
    pub async fn acquire(&self) -> Result<Duration, ScrapeError> {
        let start = Instant::now();
        loop {
            let interval_us =
                (1_000_000.0 / self.inner.adaptive.lock().unwrap().rate()) as i64;
            let inner = Arc::clone(&self.inner);
            let wait_us = tokio::task::spawn_blocking(move || {
                try_claim_slot(&inner, interval_us)
            })
            .await
            .map_err(|e| ScrapeError::transient(format!("pacing task failed: {e}")))??;

            if wait_us == 0 {
                let waited = start.elapsed();
                self.inner
                    .config
                    .event_listeners
                    .emit(&AdmissionEvent::PermitGranted {
                        name: self.inner.config.name.clone(),
                        timestamp: Instant::now(),
                        wait_duration: waited,
                    });
                return Ok(waited);
            }
            sleep(Duration::from_micros(wait_us as u64)).await;
        }
    }

    /// Reports the outcome of the single attempt the last grant paid for.
    pub fn record_outcome(&self, outcome: Outcome) {
        let changed = self.inner.adaptive.lock().unwrap().observe(outcome);
        self.inner
            .config
            .event_listeners
            .emit(&AdmissionEvent::OutcomeRecorded {
                name: self.inner.config.name.clone(),
                timestamp: Instant::now(),
                outcome,
            });
        if let Some((old_rate, new_rate)) = changed {
            self.inner
                .config
                .event_listeners
                .emit(&AdmissionEvent::RateChanged {
                    name: self.inner.config.name.clone(),
                    timestamp: Instant::now(),
                    old_rate,
                    new_rate,
                });
            #[cfg(feature = "tracing")]
            tracing::info!(
                pacer = %self.inner.config.name,
                old_rate,
                new_rate,
                "shared admission rate adjusted"
            );
        }
    }

    /// Current rate in permits per second (this process's view).
    pub fn rate(&self) -> f64 {
        self.inner.adaptive.lock().unwrap().rate()
    }
}

/// Claims the slot if free, otherwise returns how long to wait (µs).
fn try_claim_slot(inner: &SharedInner, interval_us: i64) -> Result<i64, ScrapeError> {
    let mut conn = inner.conn.lock().unwrap();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(map_sqlite)?;

    let last: Option<i64> = tx
        .query_row(
            "SELECT last_grant_us FROM pacing WHERE domain = ?1",
            params![inner.config.name],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite)?;

    let now_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| ScrapeError::fatal(format!("clock before epoch: {e}")))?
        .as_micros() as i64;

    match last {
        Some(last) if now_us < last + interval_us => {
            tx.commit().map_err(map_sqlite)?;
            Ok(last + interval_us - now_us)
        }
        _ => {
            tx.execute(
                "INSERT INTO pacing (domain, last_grant_us) VALUES (?1, ?2)
                 ON CONFLICT(domain) DO UPDATE SET last_grant_us = excluded.last_grant_us",
                params![inner.config.name, now_us],
            )
            .map_err(map_sqlite)?;
            tx.commit().map_err(map_sqlite)?;
            Ok(0)
        }
    }
}

fn map_sqlite(err: rusqlite::Error) -> ScrapeError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked =>
        {
            ScrapeError::StoreBusy
        }
        _ => ScrapeError::transient(format!("pacing table: {err}")),
    }
}
