//! Buffered metric samples.
//!
//! Workers record a sample per batch; flushing to the store happens in
//! the background every few seconds or once the buffer fills, whichever
//! comes first, so the hot path never waits on a metrics write.

use snooscope_core::MetricSample;
use snooscope_store::Store;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const FLUSH_THRESHOLD: usize = 500;

#[derive(Clone)]
pub struct MetricsBuffer {
    store: Store,
    buffer: Arc<Mutex<Vec<MetricSample>>>,
}

impl MetricsBuffer {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues a sample; kicks off a flush when the buffer is full.
    pub fn record(&self, sample: MetricSample) {
        let should_flush = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push(sample);
            buffer.len() >= FLUSH_THRESHOLD
        };
        if should_flush {
            let this = self.clone();
            tokio::spawn(async move {
                this.flush().await;
            });
        }
    }

    /// Writes everything buffered so far.
    pub async fn flush(&self) {
        let drained: Vec<MetricSample> = {
            let mut buffer = self.buffer.lock().unwrap();
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return;
        }
        if let Err(err) = self.store.record_metrics(drained).await {
            tracing::warn!(%err, "metric flush failed, samples dropped");
        }
    }

    /// Periodic flush loop; returns once `shutdown` fires, after a final
    /// flush.
    pub async fn run_flusher(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.flush().await,
                _ = shutdown.cancelled() => {
                    self.flush().await;
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}
