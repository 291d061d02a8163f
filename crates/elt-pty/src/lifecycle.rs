//! Lifecycle notifications for terminal sessions.
//!
//! Observers subscribe to a session's bus and are told about every state
//! transition and title change, in the order they happened and in
//! subscription order. A failing observer is logged and skipped; it never
//! affects the transition or the other observers. After the session's
//! `Closed` event the bus is closed and accepts no more observers.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::launcher::LaunchError;
use crate::session::{SessionId, SessionState};

/// A state transition as delivered to observers.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub session: SessionId,
    pub state: SessionState,
    /// Set when the session closed because its process could not be launched.
    pub cause: Option<Arc<LaunchError>>,
}

/// Error an observer reports from a callback. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ObserverFault(pub String);

impl ObserverFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receives lifecycle events for one session.
///
/// Callbacks run after the session lock is released, so they may call any
/// session method, including `disconnect`. Events caused by such a call are
/// delivered once the current callback round finishes.
pub trait LifecycleObserver: Send + Sync {
    fn state_changed(&self, change: &StateChange) -> Result<(), ObserverFault>;

    fn title_changed(&self, _session: SessionId, _title: &str) -> Result<(), ObserverFault> {
        Ok(())
    }
}

type SubscriptionId = u64;

#[derive(Default)]
struct Subscribers {
    next_id: SubscriptionId,
    closed: bool,
    entries: Vec<(SubscriptionId, Arc<dyn LifecycleObserver>)>,
}

/// Per-session publish/subscribe hub.
#[derive(Default)]
pub struct LifecycleBus {
    subscribers: Mutex<Subscribers>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. It receives every event published after this call.
    ///
    /// On a closed bus nothing is registered and the handle is inert.
    pub fn subscribe(self: &Arc<Self>, observer: Arc<dyn LifecycleObserver>) -> Subscription {
        let mut subscribers = self.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        if subscribers.closed {
            log::debug!("lifecycle observer {id} not registered: session closed");
            return Subscription {
                id,
                bus: Weak::new(),
            };
        }
        subscribers.entries.push((id, observer));
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    /// Remove an observer. Unknown or already removed handles are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.remove(subscription.id);
    }

    fn remove(&self, id: SubscriptionId) {
        self.subscribers.lock().entries.retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().entries.len()
    }

    /// Drop every subscription and refuse new ones. Used once the session's
    /// final event has been delivered.
    pub fn close(&self) {
        let mut subscribers = self.subscribers.lock();
        subscribers.closed = true;
        subscribers.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.subscribers.lock().closed
    }

    pub fn publish_state(&self, change: &StateChange) {
        for (id, observer) in self.snapshot() {
            deliver(id, "state_changed", || observer.state_changed(change));
        }
    }

    pub fn publish_title(&self, session: SessionId, title: &str) {
        for (id, observer) in self.snapshot() {
            deliver(id, "title_changed", || observer.title_changed(session, title));
        }
    }

    /// Observers are called outside the subscriber lock so a callback may
    /// subscribe or unsubscribe without deadlocking.
    fn snapshot(&self) -> Vec<(SubscriptionId, Arc<dyn LifecycleObserver>)> {
        self.subscribers.lock().entries.clone()
    }
}

impl fmt::Debug for LifecycleBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn deliver(id: SubscriptionId, callback: &str, call: impl FnOnce() -> Result<(), ObserverFault>) {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(fault)) => {
            log::warn!("lifecycle observer {id} failed in {callback}: {fault}");
        }
        Err(_) => {
            log::warn!("lifecycle observer {id} panicked in {callback}");
        }
    }
}

/// Handle to a registered observer.
///
/// Holds only a weak reference to the bus; dropping the handle does not
/// unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    bus: Weak<LifecycleBus>,
}

impl Subscription {
    /// Remove the observer from its bus, if the bus still exists.
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
