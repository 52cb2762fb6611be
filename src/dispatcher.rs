//! Typed publish/subscribe registry for decoded events.
//!
//! Both channels push every decoded [`Event`] into an [`EventDispatcher`];
//! the UI and cache layers subscribe to the kinds they care about.
//!
//! # Design Principle: "Snapshot, then invoke"
//!
//! `dispatch` copies the handler list for the event kind while holding the
//! lock, releases it, then calls each handler in subscription order. As a
//! consequence:
//!
//! - handlers may subscribe, unsubscribe (themselves included) or disconnect
//!   a channel without deadlocking or invalidating the iteration;
//! - such changes take effect on the next dispatch, never the current one.
//!
//! A handler that returns an error or panics is logged and skipped; the rest
//! of the handlers for that event still run.
//!
//! # Usage
//!
//! ```
//! use chatwire::dispatcher::EventDispatcher;
//! use chatwire::event::{Event, EventKind};
//!
//! let dispatcher = EventDispatcher::new();
//! let id = dispatcher.subscribe(EventKind::NewMessage, |event| {
//!     println!("message: {}", event.payload);
//!     Ok(())
//! });
//!
//! dispatcher.dispatch(&Event::new(EventKind::NewMessage, serde_json::json!({"id": 1})));
//! dispatcher.unsubscribe(id);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::event::{Event, EventKind};

/// Callback invoked for every dispatched event of a subscribed kind.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Identifier returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Registry storage: kind -> handlers in subscription order.
#[derive(Default)]
struct Registry {
    handlers: HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
    next_id: u64,
}

/// Shared, cloneable event registry.
///
/// Clones refer to the same registry, so the composition root can hand one
/// dispatcher to both channels and to every consumer.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("EventDispatcher")
            .field("kinds", &registry.handlers.len())
            .field(
                "handlers",
                &registry.handlers.values().map(Vec::len).sum::<usize>(),
            )
            .field("next_id", &registry.next_id)
            .finish()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    ///
    /// Handlers for the same kind run in the order they were subscribed.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        log::debug!("Registered handler '{}' for '{}'", id, kind);
        id
    }

    /// Remove a handler. Unknown ids are ignored.
    ///
    /// Returns `true` if a handler was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let mut removed = false;
        for handlers in registry.handlers.values_mut() {
            if let Some(idx) = handlers.iter().position(|(sub, _)| *sub == id) {
                handlers.remove(idx);
                removed = true;
                break;
            }
        }
        registry.handlers.retain(|_, handlers| !handlers.is_empty());

        if removed {
            log::debug!("Unregistered handler '{}'", id);
        }
        removed
    }

    /// Deliver `event` to every handler subscribed to its kind.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn dispatch(&self, event: &Event) -> usize {
        let handlers: Vec<(SubscriptionId, EventHandler)> = {
            let registry = self.lock();
            registry
                .handlers
                .get(&event.kind)
                .map(|list| list.iter().map(|(id, h)| (*id, Arc::clone(h))).collect())
                .unwrap_or_default()
        };
        // Lock released here

        let mut invoked = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => invoked += 1,
                Ok(Err(e)) => {
                    log::warn!("Handler '{}' for '{}' failed: {:#}", id, event.kind, e);
                }
                Err(_) => {
                    log::error!("Handler '{}' for '{}' panicked", id, event.kind);
                }
            }
        }
        invoked
    }

    /// Check if any handler is registered for `kind`.
    #[must_use]
    pub fn has_handlers(&self, kind: EventKind) -> bool {
        self.lock()
            .handlers
            .get(&kind)
            .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Total number of registered handlers across all kinds.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.lock().handlers.values().map(Vec::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panicking handler never runs under this lock, but stay usable regardless.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(kind: EventKind) -> Event {
        Event::new(kind, serde_json::json!({"id": 7}))
    }

    #[test]
    fn test_subscribe_and_dispatch() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        dispatcher.subscribe(EventKind::NewMessage, move |ev| {
            assert_eq!(ev.payload["id"], 7);
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(dispatcher.dispatch(&event(EventKind::NewMessage)), 1);
        assert_eq!(dispatcher.dispatch(&event(EventKind::Typing)), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            dispatcher.subscribe(EventKind::Reaction, move |_| {
                order.lock().unwrap().push(n);
                Ok(())
            });
        }

        dispatcher.dispatch(&event(EventKind::Reaction));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let dispatcher = EventDispatcher::new();
        let second = Arc::new(AtomicUsize::new(0));

        dispatcher.subscribe(EventKind::Notification, |_| {
            Err(anyhow::anyhow!("intentional error"))
        });
        dispatcher.subscribe(EventKind::Notification, |_| panic!("intentional panic"));
        let s = Arc::clone(&second);
        dispatcher.subscribe(EventKind::Notification, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(dispatcher.dispatch(&event(EventKind::Notification)), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_unsubscribing_itself() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let d = dispatcher.clone();
        let c = Arc::clone(&calls);
        let slot = Arc::clone(&own_id);
        let id = dispatcher.subscribe(EventKind::Presence, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot.lock().unwrap() {
                d.unsubscribe(id);
            }
            Ok(())
        });
        *own_id.lock().unwrap() = Some(id);

        assert_eq!(dispatcher.dispatch(&event(EventKind::Presence)), 1);
        assert_eq!(dispatcher.dispatch(&event(EventKind::Presence)), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.has_handlers(EventKind::Presence));
    }

    #[test]
    fn test_unsubscribe_during_dispatch_applies_next_pass() {
        let dispatcher = EventDispatcher::new();
        let later_calls = Arc::new(AtomicUsize::new(0));
        let later_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        // First handler removes the second one mid-dispatch.
        let d = dispatcher.clone();
        let slot = Arc::clone(&later_id);
        dispatcher.subscribe(EventKind::Typing, move |_| {
            if let Some(id) = slot.lock().unwrap().take() {
                d.unsubscribe(id);
            }
            Ok(())
        });
        let c = Arc::clone(&later_calls);
        let id = dispatcher.subscribe(EventKind::Typing, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        *later_id.lock().unwrap() = Some(id);

        // Current pass still sees the snapshot.
        assert_eq!(dispatcher.dispatch(&event(EventKind::Typing)), 2);
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);

        assert_eq!(dispatcher.dispatch(&event(EventKind::Typing)), 1);
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_during_dispatch_applies_next_pass() {
        let dispatcher = EventDispatcher::new();
        let added = Arc::new(AtomicUsize::new(0));

        let d = dispatcher.clone();
        let a = Arc::clone(&added);
        dispatcher.subscribe(EventKind::ReadReceipt, move |_| {
            let a = Arc::clone(&a);
            d.subscribe(EventKind::ReadReceipt, move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        assert_eq!(dispatcher.dispatch(&event(EventKind::ReadReceipt)), 1);
        assert_eq!(added.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.handler_count(), 2);
    }

    #[test]
    fn test_unsubscribe_unknown_id_is_noop() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.subscribe(EventKind::Error, |_| Ok(()));
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[test]
    fn test_subscription_id_display() {
        let dispatcher = EventDispatcher::new();
        let first = dispatcher.subscribe(EventKind::Message, |_| Ok(()));
        let second = dispatcher.subscribe(EventKind::Message, |_| Ok(()));
        assert_eq!(first.to_string(), "sub_0");
        assert_eq!(second.to_string(), "sub_1");
    }
}
