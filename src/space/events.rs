//! Space events, observers and subscriptions.
//!
//! Every successful mutation produces one event after the space lock is
//! released. Observers run synchronously in registration order; channel
//! subscribers are fed with non-blocking `try_send` and never stall the
//! mutator. Events carry their origin so replication code can tell local
//! mutations (which must fan out) from replicated ones (which must not
//! echo back into the mesh).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::atom::Atom;
use crate::cluster::member::NodeId;

/// Default buffer size of a channel subscription.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// What happened to an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new atom entered the space.
    AtomAdded,
    /// An atom left the space.
    AtomRemoved,
    /// An existing atom's truth value changed (merge or replacement).
    TruthValueChanged,
}

/// Where a mutation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventOrigin {
    /// Made by this process through the public API.
    Local,
    /// Applied from a sync operation that originated elsewhere.
    Replicated {
        /// The node that originated the mutation.
        source: NodeId,
    },
}

impl EventOrigin {
    /// Returns true for locally originated mutations.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

/// One mutation, as seen by observers and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomEvent {
    /// What happened.
    pub kind: EventKind,
    /// The atom after the mutation (for removals, the removed atom).
    pub atom: Atom,
    /// Where the mutation came from.
    pub origin: EventOrigin,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl AtomEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, atom: Atom, origin: EventOrigin) -> Self {
        Self {
            kind,
            atom,
            origin,
            timestamp: Utc::now(),
        }
    }
}

/// Synchronous observer of space mutations.
///
/// Called in registration order after every successful mutation, outside
/// the space lock. Implementations must be fast; anything slow belongs
/// behind a channel subscription instead.
pub trait SpaceObserver: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &AtomEvent);
}

/// Observer registrations and channel subscriptions for one space.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn SpaceObserver>>>,
    subscribers: Mutex<Vec<Sender<AtomEvent>>>,
    dropped_events: AtomicU64,
}

impl ObserverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous observer. Observers fire in registration
    /// order and are never unregistered implicitly.
    pub fn register(&self, observer: Arc<dyn SpaceObserver>) {
        self.lock_observers().push(observer);
    }

    /// Opens a subscription with the default buffer capacity.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<AtomEvent> {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Opens a subscription with an explicit buffer capacity.
    ///
    /// A subscriber that falls behind loses events rather than blocking
    /// mutators; losses show up in [`ObserverRegistry::dropped_events`].
    #[must_use]
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Receiver<AtomEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.lock_subscribers().push(tx);
        rx
    }

    /// Delivers an event to every observer, then every subscriber.
    ///
    /// A panicking observer is caught and skipped so one bad observer
    /// cannot take down mutators or starve the observers after it.
    pub fn dispatch(&self, event: &AtomEvent) {
        let observers: Vec<Arc<dyn SpaceObserver>> = self.lock_observers().clone();
        for observer in observers {
            let result = catch_unwind(AssertUnwindSafe(|| observer.on_event(event)));
            if result.is_err() {
                tracing::error!(kind = ?event.kind, "space observer panicked; skipping");
            }
        }

        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of events dropped because a subscriber buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Number of registered synchronous observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.lock_observers().len()
    }

    /// Number of live channel subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn SpaceObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Sender<AtomEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.observer_count())
            .field("subscribers", &self.subscriber_count())
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}
