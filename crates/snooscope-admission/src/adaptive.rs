//! Error-rate-driven rate adjustment.
//!
//! A rolling window of recent call outcomes drives multiplicative rate
//! changes: a high error share halves the rate, a near-clean window nudges
//! it back up by 10%. Both directions are clamped to `[min_rate,
//! max_rate]`. An adjustment clears the window, so the policy re-decides
//! only after fresh evidence accumulates.

use std::collections::VecDeque;

use crate::pacer::Outcome;

/// Minimum observations before the policy is allowed to move the rate.
const MIN_SAMPLES: usize = 10;

/// Error share above which the rate is halved.
const BACKOFF_THRESHOLD: f64 = 0.30;

/// Error share below which the rate creeps back up.
const RECOVER_THRESHOLD: f64 = 0.05;

const BACKOFF_FACTOR: f64 = 0.5;
const RECOVER_FACTOR: f64 = 1.1;

/// Rolling-window adaptive rate controller.
#[derive(Debug)]
pub struct AdaptiveRate {
    rate: f64,
    min_rate: f64,
    max_rate: f64,
    window_size: usize,
    /// true = the call failed (error or rate-limited).
    window: VecDeque<bool>,
}

impl AdaptiveRate {
    pub fn new(initial_rate: f64, min_rate: f64, max_rate: f64, window_size: usize) -> Self {
        Self {
            rate: initial_rate.clamp(min_rate, max_rate),
            min_rate,
            max_rate,
            window_size: window_size.max(1),
            window: VecDeque::with_capacity(window_size.max(1)),
        }
    }

    /// Current rate in permits per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Records one outcome. Returns `Some((old, new))` when the rate
    /// moved.
    pub fn observe(&mut self, outcome: Outcome) -> Option<(f64, f64)> {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(!matches!(outcome, Outcome::Ok));

        if self.window.len() < MIN_SAMPLES {
            return None;
        }

        let errors = self.window.iter().filter(|&&e| e).count();
        let error_rate = errors as f64 / self.window.len() as f64;

        let target = if error_rate > BACKOFF_THRESHOLD {
            (self.rate * BACKOFF_FACTOR).max(self.min_rate)
        } else if error_rate < RECOVER_THRESHOLD && self.rate < self.max_rate {
            (self.rate * RECOVER_FACTOR).min(self.max_rate)
        } else {
            return None;
        };

        if (target - self.rate).abs() < f64::EPSILON {
            return None;
        }

        let old = self.rate;
        self.rate = target;
        self.window.clear();
        Some((old, target))
    }
}
