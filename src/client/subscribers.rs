//! Observer registry for inbound messages and connection state.
//!
//! [`Subscribers`] keeps one list of handlers per signal. Registration is
//! independent from delivery: handlers can be added or removed at any time
//! and each delivery works on a snapshot of the list, invoked in
//! registration order. A panicking handler is logged and skipped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::state::ConnectionState;

/// Handler for complete inbound messages.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Handler for every state transition.
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Handler for flips between connected and not connected.
pub type ConnectivityHandler = Arc<dyn Fn() + Send + Sync>;

/// Token returned by a registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Registry<H> = RwLock<Vec<(SubscriptionId, H)>>;

/// Handler lists of one client.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    messages: Registry<MessageHandler>,
    states: Registry<StateHandler>,
    connectivity: Registry<ConnectivityHandler>,
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("messages", &len(&self.messages))
            .field("states", &len(&self.states))
            .field("connectivity", &len(&self.connectivity))
            .finish()
    }
}

impl Subscribers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for inbound messages.
    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.register(&self.messages, Arc::new(handler))
    }

    /// Registers a handler for every state transition.
    pub fn on_state_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.register(&self.states, Arc::new(handler))
    }

    /// Registers a handler for connected/not-connected flips.
    pub fn on_connectivity_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(&self.connectivity, Arc::new(handler))
    }

    /// Removes a handler from whichever list holds it.
    ///
    /// Returns `false` if the id was unknown or already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        remove(&self.messages, id) || remove(&self.states, id) || remove(&self.connectivity, id)
    }

    /// Delivers one inbound message to every message handler.
    pub fn publish_message(&self, text: &str) {
        for handler in snapshot(&self.messages) {
            if catch_unwind(AssertUnwindSafe(|| handler(text))).is_err() {
                tracing::warn!("message handler panicked; continuing delivery");
            }
        }
    }

    /// Announces a transition from `previous` to `next`.
    ///
    /// State handlers see every transition; connectivity handlers only see
    /// the ones that enter or leave [`ConnectionState::Connected`].
    pub fn publish_state(&self, previous: ConnectionState, next: ConnectionState) {
        for handler in snapshot(&self.states) {
            if catch_unwind(AssertUnwindSafe(|| handler(next))).is_err() {
                tracing::warn!(state = %next, "state handler panicked");
            }
        }
        if previous.is_connected() != next.is_connected() {
            for handler in snapshot(&self.connectivity) {
                if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                    tracing::warn!("connectivity handler panicked");
                }
            }
        }
    }

    fn register<H>(&self, registry: &Registry<H>, handler: H) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }
}

fn snapshot<H: Clone>(registry: &Registry<H>) -> Vec<H> {
    registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, handler)| handler.clone())
        .collect()
}

fn remove<H>(registry: &Registry<H>, id: SubscriptionId) -> bool {
    let mut handlers = registry.write().unwrap_or_else(PoisonError::into_inner);
    let before = handlers.len();
    handlers.retain(|(existing, _)| *existing != id);
    handlers.len() != before
}

fn len<H>(registry: &Registry<H>) -> usize {
    registry.read().unwrap_or_else(PoisonError::into_inner).len()
}
