//! Event infrastructure for cowrite-core.
//!
//! `EventBus<E>` is a small callback registry used in two places:
//! - editor surfaces publish content changes on an `EventBus<String>`
//! - sessions publish `CollabEvent`s for host monitoring
//!
//! A bus can be suspended with [`EventBus::suspend`]; while any
//! [`SuspendGuard`] is alive, `emit` is a no-op. This is how remote edits are
//! written to a surface without being detected as local changes.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Session events emitted for host monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CollabEvent {
    /// Socket connected and join announced.
    Connected,
    /// Socket lost or closed.
    Disconnected,
    /// Waiting before the next connection attempt.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Retry budget exhausted; syncing through the local store from now on.
    FallbackActivated,
    /// A local edit was sent (or written to the fallback store).
    LocalEditSent { position: usize },
    /// A remote edit was applied to the surface.
    RemoteEditApplied { user_id: String, position: usize },
    /// A remote edit could not be applied and was dropped.
    RemoteEditRejected { user_id: String, reason: String },
    PeerJoined { user_id: String },
    PeerLeft { user_id: String },
    CursorMoved { user_id: String },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription<E: 'static> {
    bus: Weak<EventBus<E>>,
    id: usize,
}

impl<E: 'static> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Keeps a bus suspended until dropped. Guards nest.
pub struct SuspendGuard<'a, E: 'static> {
    bus: &'a EventBus<E>,
}

impl<E: 'static> Drop for SuspendGuard<'_, E> {
    fn drop(&mut self) {
        self.bus.suspended.fetch_sub(1, Ordering::SeqCst);
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E: 'static> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
    suspended: AtomicUsize,
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            suspended: AtomicUsize::new(0),
        }
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers, unless suspended.
    pub fn emit(&self, event: E) {
        if self.is_suspended() {
            return;
        }

        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }

    /// Silence `emit` until the returned guard is dropped.
    pub fn suspend(&self) -> SuspendGuard<'_, E> {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        SuspendGuard { bus: self }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) > 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_bus() -> (Arc<EventBus<CollabEvent>>, Arc<AtomicUsize>) {
        (Arc::new(EventBus::new()), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_subscribe_and_emit() {
        let (bus, count) = counting_bus();
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(CollabEvent::Connected);

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let (bus, count) = counting_bus();
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(CollabEvent::Connected);
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(CollabEvent::Disconnected);

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_multiple_subscribers() {
        let (bus, count1) = counting_bus();
        let count2 = Arc::new(AtomicUsize::new(0));

        let count1_clone = Arc::clone(&count1);
        let count2_clone = Arc::clone(&count2);

        let _sub1 = bus.subscribe(move |_| {
            count1_clone.fetch_add(1, Ordering::Relaxed);
        });
        let sub2 = bus.subscribe(move |_| {
            count2_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(CollabEvent::FallbackActivated);
        drop(sub2);
        bus.emit(CollabEvent::FallbackActivated);

        assert_eq!(count1.load(Ordering::Relaxed), 2);
        assert_eq!(count2.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_suspend_silences_emit() {
        let bus: Arc<EventBus<String>> = Arc::new(EventBus::new());
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = bus.subscribe(move |content: &String| {
            seen_clone.write().unwrap().push(content.clone());
        });

        bus.emit("a".to_string());
        {
            let _outer = bus.suspend();
            {
                let _inner = bus.suspend();
                bus.emit("b".to_string());
            }
            assert!(bus.is_suspended());
            bus.emit("c".to_string());
        }
        assert!(!bus.is_suspended());
        bus.emit("d".to_string());

        assert_eq!(*seen.read().unwrap(), vec!["a".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_collab_event_serialization() {
        let event = CollabEvent::RemoteEditApplied {
            user_id: "bob".into(),
            position: 5,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"remoteEditApplied\""));
        assert!(json.contains("\"userId\":\"bob\""));
        assert!(json.contains("\"position\":5"));

        let json = serde_json::to_string(&CollabEvent::Reconnecting {
            attempt: 2,
            delay_ms: 2000,
        })
        .unwrap();
        assert!(json.contains("\"delayMs\":2000"));
    }
}
