//! Listener plumbing for component-level observability hooks.
//!
//! Components (pacer, circuit breaker) expose `on_*` builder hooks backed
//! by this module. It is deliberately separate from [`crate::bus`]: these
//! listeners are synchronous callbacks owned by one component instance,
//! while the bus fans frames out to live API subscribers.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// An event emitted by a runtime component.
pub trait ComponentEvent: Send + Sync + fmt::Debug {
    /// Short machine name of the event, e.g. `"state_transition"`.
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn timestamp(&self) -> Instant;

    /// Name of the component instance that emitted it.
    fn source_name(&self) -> &str;
}

/// A synchronous observer of component events.
pub trait EventListener<E: ComponentEvent>: Send + Sync {
    fn on_event(&self, event: &E);
}

/// A set of listeners attached to one component instance.
///
/// Emitting catches listener panics so one misbehaving callback cannot
/// take the others (or the component) down with it.
#[derive(Clone)]
pub struct EventListeners<E: ComponentEvent> {
    listeners: Vec<Arc<dyn EventListener<E>>>,
}

impl<E: ComponentEvent> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));
            if result.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    source = event.source_name(),
                    event_type = event.event_type(),
                    "component event listener panicked"
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: ComponentEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts a closure into an [`EventListener`].
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _phantom: std::marker::PhantomData<E>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: ComponentEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestEvent {
        at: Instant,
    }

    impl ComponentEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            "test"
        }
        fn timestamp(&self) -> Instant {
            self.at
        }
        fn source_name(&self) -> &str {
            "test-source"
        }
    }

    #[test]
    fn all_listeners_receive_the_event() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut listeners = EventListeners::new();
        for _ in 0..3 {
            let c = Arc::clone(&count);
            listeners.add(FnListener::new(move |_: &TestEvent| {
                c.fetch_add(1, Ordering::Relaxed);
            }));
        }
        listeners.emit(&TestEvent { at: Instant::now() });
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn panicking_listener_does_not_starve_the_rest() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(|_: &TestEvent| {
            panic!("listener bug");
        }));
        let c = Arc::clone(&count);
        listeners.add(FnListener::new(move |_: &TestEvent| {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        listeners.emit(&TestEvent { at: Instant::now() });
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
