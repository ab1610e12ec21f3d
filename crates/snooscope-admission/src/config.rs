use crate::events::AdmissionEvent;
use crate::pacer::Pacer;
use crate::shared::SharedPacer;
use snooscope_core::events::{EventListeners, FnListener};
use std::path::Path;
use std::time::Duration;

/// Configuration for an admission token.
pub struct PacerConfig {
    pub(crate) rate: f64,
    pub(crate) min_rate: f64,
    pub(crate) max_rate: f64,
    pub(crate) window_size: usize,
    pub(crate) name: String,
    pub(crate) event_listeners: EventListeners<AdmissionEvent>,
}

impl PacerConfig {
    pub fn builder() -> PacerConfigBuilder {
        PacerConfigBuilder::new()
    }
}

/// Builder for [`PacerConfig`].
pub struct PacerConfigBuilder {
    rate: f64,
    min_rate: f64,
    max_rate: f64,
    window_size: usize,
    name: String,
    event_listeners: EventListeners<AdmissionEvent>,
}

impl Default for PacerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacerConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - rate: 1.0 permits/second
    /// - min_rate: 0.1, max_rate: 10.0
    /// - window_size: 100 outcomes
    /// - name: `"<unnamed>"`
    pub fn new() -> Self {
        Self {
            rate: 1.0,
            min_rate: 0.1,
            max_rate: 10.0,
            window_size: 100,
            name: "<unnamed>".to_string(),
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the initial rate in permits per second.
    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Sets the floor the adaptive policy may back off to.
    pub fn min_rate(mut self, rate: f64) -> Self {
        self.min_rate = rate;
        self
    }

    /// Sets the ceiling the adaptive policy may recover to.
    pub fn max_rate(mut self, rate: f64) -> Self {
        self.max_rate = rate;
        self
    }

    /// Sets how many recent outcomes the adaptive policy considers.
    pub fn window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    /// Sets the name for this token (used in events and logs).
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Registers a callback invoked with the wait each granted caller
    /// experienced.
    pub fn on_permit_granted<F>(mut self, f: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let AdmissionEvent::PermitGranted { wait_duration, .. } = event {
                f(*wait_duration);
            }
        }));
        self
    }

    /// Registers a callback invoked when the adaptive policy moves the
    /// rate, with `(old, new)` permits/second.
    pub fn on_rate_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, f64) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let AdmissionEvent::RateChanged {
                old_rate, new_rate, ..
            } = event
            {
                f(*old_rate, *new_rate);
            }
        }));
        self
    }

    fn build_config(self) -> PacerConfig {
        PacerConfig {
            rate: self.rate,
            min_rate: self.min_rate,
            max_rate: self.max_rate,
            window_size: self.window_size,
            name: self.name,
            event_listeners: self.event_listeners,
        }
    }

    /// Builds the in-process variant.
    pub fn build_local(self) -> Pacer {
        Pacer::new(self.build_config())
    }

    /// Builds the process-shared variant backed by the `pacing` table in
    /// the store file at `path`.
    pub fn build_shared(self, path: &Path) -> Result<SharedPacer, rusqlite::Error> {
        SharedPacer::open(path, self.build_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let pacer = PacerConfig::builder().build_local();
        assert!((pacer.rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn builder_custom_values() {
        let pacer = PacerConfig::builder()
            .rate(4.0)
            .min_rate(0.5)
            .max_rate(8.0)
            .window_size(50)
            .name("forum")
            .build_local();
        assert!((pacer.rate() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn listener_registration_compiles() {
        let _pacer = PacerConfig::builder()
            .on_permit_granted(|_| {})
            .on_rate_changed(|_, _| {})
            .build_local();
    }
}
