//! Process-wide event fan-out.
//!
//! One publisher side, any number of subscribers, each with its own
//! bounded queue. Publishing is strictly non-blocking: a full queue drops
//! the frame for that subscriber only and bumps its drop counter. A
//! subscriber that never drains therefore costs the system nothing beyond
//! one queue's worth of memory.

use crate::session::SessionStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// A frame delivered to live subscribers. Serializes with a `type`
/// discriminator so dashboard clients can switch on it directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionStarted {
        session_id: Uuid,
        ts: DateTime<Utc>,
        subreddits: Vec<String>,
    },
    Progress {
        session_id: Uuid,
        ts: DateTime<Utc>,
        progress: f64,
        posts_scraped: u64,
        users_scraped: u64,
        errors: u64,
    },
    SessionCompleted {
        session_id: Uuid,
        ts: DateTime<Utc>,
        posts_scraped: u64,
        users_scraped: u64,
    },
    SessionFailed {
        session_id: Uuid,
        ts: DateTime<Utc>,
        error: String,
    },
    StatusUpdate {
        session_id: Uuid,
        ts: DateTime<Utc>,
        status: SessionStatus,
    },
    StoreWrite {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        ts: DateTime<Utc>,
        posts: usize,
        users: usize,
    },
    Metric {
        ts: DateTime<Utc>,
        operation: String,
        duration_ms: u64,
        ok: bool,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SessionStarted { .. } => EventKind::SessionStarted,
            Event::Progress { .. } => EventKind::Progress,
            Event::SessionCompleted { .. } => EventKind::SessionCompleted,
            Event::SessionFailed { .. } => EventKind::SessionFailed,
            Event::StatusUpdate { .. } => EventKind::StatusUpdate,
            Event::StoreWrite { .. } => EventKind::StoreWrite,
            Event::Metric { .. } => EventKind::Metric,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Event::SessionStarted { session_id, .. }
            | Event::Progress { session_id, .. }
            | Event::SessionCompleted { session_id, .. }
            | Event::SessionFailed { session_id, .. }
            | Event::StatusUpdate { session_id, .. } => Some(*session_id),
            Event::StoreWrite { session_id, .. } => *session_id,
            Event::Metric { .. } => None,
        }
    }
}

/// Discriminator used by subscriber filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    Progress,
    SessionCompleted,
    SessionFailed,
    StatusUpdate,
    StoreWrite,
    Metric,
}

impl EventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session_started" => Some(EventKind::SessionStarted),
            "progress" => Some(EventKind::Progress),
            "session_completed" => Some(EventKind::SessionCompleted),
            "session_failed" => Some(EventKind::SessionFailed),
            "status_update" => Some(EventKind::StatusUpdate),
            "store_write" => Some(EventKind::StoreWrite),
            "metric" => Some(EventKind::Metric),
            _ => None,
        }
    }
}

struct SubscriberSlot {
    id: u64,
    kinds: Option<Vec<EventKind>>,
    tx: mpsc::Sender<Event>,
    drops: Arc<AtomicU64>,
}

impl SubscriberSlot {
    fn wants(&self, kind: EventKind) -> bool {
        match &self.kinds {
            None => true,
            Some(kinds) => kinds.contains(&kind),
        }
    }
}

/// The fan-out hub. Cheap to clone; all clones publish to the same
/// subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_id: AtomicU64,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    /// Creates a bus whose subscribers each get a queue of `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a subscriber. `kinds: None` receives everything.
    pub fn subscribe(&self, kinds: Option<Vec<EventKind>>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let drops = Arc::new(AtomicU64::new(0));
        let slot = SubscriberSlot {
            id,
            kinds,
            tx,
            drops: Arc::clone(&drops),
        };
        self.inner
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(slot);
        Subscription { id, rx, drops }
    }

    /// Delivers `event` to every interested subscriber without blocking.
    ///
    /// Full queues drop the frame for that subscriber only; closed
    /// subscribers are pruned in place.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("subscriber list poisoned");
        subscribers.retain(|slot| {
            if !slot.wants(kind) {
                return !slot.tx.is_closed();
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.drops.fetch_add(1, Ordering::Relaxed);
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(subscriber = slot.id, ?kind, "slow subscriber, frame dropped");
                    #[cfg(feature = "metrics")]
                    metrics::counter!(
                        "slow_subscriber_drops",
                        "sub_id" => slot.id.to_string()
                    )
                    .increment(1);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .len()
    }

    /// Total frames published since the bus was created.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Total frames dropped across all subscribers.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// A subscriber's receiving half. Dropping it detaches from the bus.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    drops: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once detached from a dropped bus.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for drain loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Frames this subscriber has lost to a full queue.
    pub fn dropped(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}
