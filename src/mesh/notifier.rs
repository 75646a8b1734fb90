//! Fan-out of peer state changes to application observers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::PeerStateObserver;
use crate::transport::{PeerIdentity, PeerLinkState};

/// Handle returned by [`PeerNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of state observers.
///
/// Observers run synchronously in subscription order. The registry lock is
/// released before they are called, so an observer may subscribe or
/// unsubscribe without deadlocking.
#[derive(Default)]
pub struct PeerNotifier {
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn PeerStateObserver>)>>,
    next_id: AtomicU64,
}

impl PeerNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn subscribe(&self, observer: impl PeerStateObserver) -> SubscriptionId {
        self.subscribe_arc(Arc::new(observer))
    }

    /// Register a shared observer.
    pub fn subscribe_arc(&self, observer: Arc<dyn PeerStateObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver a state change to every observer.
    pub fn notify(&self, peer: &PeerIdentity, state: PeerLinkState) {
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            observer.on_state_change(peer, state);
        }
    }
}

impl PeerStateObserver for PeerNotifier {
    fn on_state_change(&self, peer: &PeerIdentity, state: PeerLinkState) {
        self.notify(peer, state);
    }
}

impl fmt::Debug for PeerNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerNotifier")
            .field("observers", &self.observer_count())
            .finish()
    }
}
