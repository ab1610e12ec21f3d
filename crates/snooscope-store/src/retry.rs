//! Bounded retry for contended writes.

use crate::error::{is_contention, StoreError};
use rand::Rng;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_millis(10);

/// Runs `f`, retrying on SQLite busy/locked with jittered exponential
/// backoff. Exhaustion surfaces as [`StoreError::Busy`].
///
/// This sits on top of the per-connection busy_timeout: the timeout
/// absorbs short lock windows, the retry absorbs whole busy statements.
pub(crate) fn with_busy_retry<T>(
    mut f: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 0u32;
    loop {
        match f() {
            Err(StoreError::Sqlite(err)) if is_contention(&err) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    tracing::warn!(attempts = attempt, "store write contention budget spent");
                    return Err(StoreError::Busy);
                }
                let exp = BASE_DELAY.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
                let jitter = rand::rng().random_range(0.5..=1.5);
                std::thread::sleep(Duration::from_secs_f64(exp * jitter));
            }
            other => return other,
        }
    }
}
