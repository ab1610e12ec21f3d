//! Backoff arithmetic shared by the client's retry loops.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with ±25% jitter.
///
/// `attempt` is zero-based: attempt 0 waits ~`base`, attempt 1 ~`2*base`,
/// and so on, each sample uniformly jittered to avoid retry stampedes.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let jitter = rand::rng().random_range(0.75..=1.25);
    Duration::from_secs_f64(exp * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let base = Duration::from_secs(1);
        for attempt in 0..4 {
            let d = backoff_delay(base, attempt).as_secs_f64();
            let nominal = 2f64.powi(attempt as i32);
            assert!(d >= nominal * 0.75, "attempt {attempt}: {d} too small");
            assert!(d <= nominal * 1.25, "attempt {attempt}: {d} too large");
        }
    }
}
