//! In-process publish/subscribe keyed by event name.
//!
//! The [`EventBus`] delivers [`EngineEvent`]s synchronously to every listener
//! registered for the event's name, in registration order. The listener list
//! is cloned before dispatch, so subscribing or unsubscribing from inside a
//! listener never affects the pass that is already running.
//!
//! Listeners are `Fn + Send + Sync` closures. The bus guards its table with
//! its own lock, which is never held while a listener runs, so listeners may
//! freely call back into whatever owns the bus. A panicking listener is
//! logged and skipped; the remaining listeners still receive the event.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use kestrel_core::event::{names, EngineEvent, EventBus};
//!
//! let bus = Arc::new(EventBus::new());
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = hits.clone();
//! let sub = bus.subscribe(names::ENTITY_REGISTERED, move |_event| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! bus.publish(&EngineEvent::new(names::ENTITY_REGISTERED, serde_json::json!({}), 0));
//! sub.unsubscribe();
//! bus.publish(&EngineEvent::new(names::ENTITY_REGISTERED, serde_json::json!({}), 0));
//!
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Event names emitted by the engine.
pub mod names {
    pub const ENTITY_REGISTERED: &str = "entity:registered";
    pub const ENTITY_UPDATED: &str = "entity:updated";
    pub const ENTITY_REMOVED: &str = "entity:removed";
    pub const ACTION_SCHEDULED: &str = "action:scheduled";
    pub const ACTION_EXECUTED: &str = "action:executed";
    pub const ACTION_FAILED: &str = "action:failed";
    pub const ENGINE_STARTED: &str = "engine:started";
    pub const ENGINE_STOPPED: &str = "engine:stopped";
}

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

/// A named event with a JSON payload, stamped with virtual time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub name: String,
    pub payload: serde_json::Value,
    /// Virtual-clock time (ms) at which the event was raised.
    pub at: u64,
}

impl EngineEvent {
    pub fn new(name: impl Into<String>, payload: serde_json::Value, at: u64) -> Self {
        Self {
            name: name.into(),
            payload,
            at,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// String-keyed synchronous publish/subscribe.
pub struct EventBus {
    listeners: Mutex<BTreeMap<String, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
    panicked: AtomicU64,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            panicked: AtomicU64::new(0),
        }
    }

    /// Register `handler` for events named `event`.
    ///
    /// The returned [`Subscription`] removes the handler when
    /// [`unsubscribe`](Subscription::unsubscribe) is called. Dropping it
    /// without calling `unsubscribe` leaves the handler registered.
    pub fn subscribe<F>(self: &Arc<Self>, event: &str, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(event.to_owned())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(self),
            event: event.to_owned(),
            id,
        }
    }

    fn remove(&self, event: &str, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Deliver `event` to its listeners. Returns how many were invoked.
    ///
    /// A listener that panics does not stop delivery to the ones after it.
    pub fn publish(&self, event: &EngineEvent) -> usize {
        let snapshot: Vec<(u64, Listener)> = match self.listeners.lock().get(&event.name) {
            Some(list) => list.iter().map(|(id, l)| (*id, Arc::clone(l))).collect(),
            None => return 0,
        };
        for (id, listener) in &snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event = %event.name,
                    listener = *id,
                    panic = panic_message(&*panic),
                    "event listener panicked"
                );
            }
        }
        snapshot.len()
    }

    /// Total listener invocations that panicked since the bus was created.
    pub fn panicked_listeners(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Number of listeners for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.lock().get(event).map_or(0, Vec::len)
    }

    /// Listener counts per event name, ordered by name.
    pub fn listener_counts(&self) -> BTreeMap<String, usize> {
        self.listeners
            .lock()
            .iter()
            .map(|(name, list)| (name.clone(), list.len()))
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_counts())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle for removing a listener registered with [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<EventBus>,
    event: String,
    id: u64,
}

impl Subscription {
    /// The event name this subscription listens to.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the listener. Returns `false` if it was already gone or the
    /// bus no longer exists.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(&self.event, self.id),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
