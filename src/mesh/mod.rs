//! Peer mesh: a bounded pool of mutually authenticated peer links.
//!
//! - [`PeerPool`] dials peers, enforces capacity, probes liveness and
//!   reconnects with backoff
//! - [`PeerNotifier`] fans state changes out to application observers

mod notifier;
mod pool;

pub use notifier::{PeerNotifier, SubscriptionId};
pub use pool::{PeerPool, PeerPoolMetrics, PeerReport};
