//! Transport layer for peer links.
//!
//! - **Framing**: [`Frame`], [`FrameType`] and the 6-byte header codec
//! - **Links**: [`PeerLink`], a framed duplex stream with state and metrics
//! - **Backoff**: [`Backoff`] for reconnection delays
//! - **TLS**: mutual TLS configuration and the [`PeerDialer`] seam
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Peer pool / socket pool         │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   frames, links, backoff, dialing       │
//! ├─────────────────────────────────────────┤
//! │         TLS over TCP                    │
//! └─────────────────────────────────────────┘
//! ```

mod error;
mod frame;
mod link;
#[cfg(feature = "mesh")]
mod timing;
#[cfg(feature = "mesh")]
pub mod tls;

pub use error::*;
pub use frame::*;
pub use link::*;
#[cfg(feature = "mesh")]
pub use timing::Backoff;
#[cfg(feature = "mesh")]
pub use tls::{PeerDialer, TlsDialer};
