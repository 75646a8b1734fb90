//! Callback interfaces exposed to the application layer.

use crate::transport::{PeerIdentity, PeerLinkState};

/// Receives peer link state transitions.
///
/// Implementations are invoked synchronously from the task that drives the
/// transition (a link closing, or the pool's reconnection supervisor), so
/// they MUST NOT block. Hand long work off to a channel or a spawned task.
///
/// Any `Fn(&PeerIdentity, PeerLinkState)` closure is an observer:
///
/// ```
/// use meshlink::prelude::*;
///
/// let notifier = PeerNotifier::new();
/// notifier.subscribe(|peer: &PeerIdentity, state: PeerLinkState| {
///     println!("{peer} is now {state}");
/// });
/// assert_eq!(notifier.observer_count(), 1);
/// ```
pub trait PeerStateObserver: Send + Sync + 'static {
    /// Called on every state transition of a peer link.
    fn on_state_change(&self, peer: &PeerIdentity, state: PeerLinkState);
}

impl<F> PeerStateObserver for F
where
    F: Fn(&PeerIdentity, PeerLinkState) + Send + Sync + 'static,
{
    fn on_state_change(&self, peer: &PeerIdentity, state: PeerLinkState) {
        self(peer, state)
    }
}
