//! Events emitted by admission tokens.

use snooscope_core::events::ComponentEvent;
use std::time::{Duration, Instant};

use crate::pacer::Outcome;

/// Observability events for one pacer instance.
#[derive(Debug, Clone)]
pub enum AdmissionEvent {
    /// A caller was granted a slot after waiting `wait_duration`.
    PermitGranted {
        name: String,
        timestamp: Instant,
        wait_duration: Duration,
    },
    /// A caller reported the outcome of its single attempt.
    OutcomeRecorded {
        name: String,
        timestamp: Instant,
        outcome: Outcome,
    },
    /// The adaptive policy moved the rate.
    RateChanged {
        name: String,
        timestamp: Instant,
        old_rate: f64,
        new_rate: f64,
    },
}

impl ComponentEvent for AdmissionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AdmissionEvent::PermitGranted { .. } => "permit_granted",
            AdmissionEvent::OutcomeRecorded { .. } => "outcome_recorded",
            AdmissionEvent::RateChanged { .. } => "rate_changed",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            AdmissionEvent::PermitGranted { timestamp, .. }
            | AdmissionEvent::OutcomeRecorded { timestamp, .. }
            | AdmissionEvent::RateChanged { timestamp, .. } => *timestamp,
        }
    }

    fn source_name(&self) -> &str {
        match self {
            AdmissionEvent::PermitGranted { name, .. }
            | AdmissionEvent::OutcomeRecorded { name, .. }
            | AdmissionEvent::RateChanged { name, .. } => name,
        }
    }
}
