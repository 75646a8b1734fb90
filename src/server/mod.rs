//! Client-facing connection pool.
//!
//! [`ClientSocketPool`] owns the streams of connected clients, bounds their
//! number, broadcasts to them and drops the ones that go quiet.

mod session;
mod socket_pool;

pub use session::ClientSession;
pub use socket_pool::{ClientSocketPool, ClosedCallback, SocketPoolMetrics};
