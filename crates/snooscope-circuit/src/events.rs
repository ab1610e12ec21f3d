//! Events emitted by a circuit breaker instance.

use crate::breaker::CircuitState;
use snooscope_core::events::ComponentEvent;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum CircuitEvent {
    /// The breaker moved between states.
    StateTransition {
        name: String,
        timestamp: Instant,
        from: CircuitState,
        to: CircuitState,
    },
    /// A call was rejected because the circuit is open.
    CallRejected { name: String, timestamp: Instant },
    /// A failure was recorded against the endpoint.
    FailureRecorded {
        name: String,
        timestamp: Instant,
        consecutive_failures: u32,
    },
}

impl ComponentEvent for CircuitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CircuitEvent::StateTransition { .. } => "state_transition",
            CircuitEvent::CallRejected { .. } => "call_rejected",
            CircuitEvent::FailureRecorded { .. } => "failure_recorded",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            CircuitEvent::StateTransition { timestamp, .. }
            | CircuitEvent::CallRejected { timestamp, .. }
            | CircuitEvent::FailureRecorded { timestamp, .. } => *timestamp,
        }
    }

    fn source_name(&self) -> &str {
        match self {
            CircuitEvent::StateTransition { name, .. }
            | CircuitEvent::CallRejected { name, .. }
            | CircuitEvent::FailureRecorded { name, .. } => name,
        }
    }
}
