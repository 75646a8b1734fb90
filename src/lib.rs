//! # meshlink
//!
//! Transport core for a peer-to-peer messaging server. It provides:
//!
//! - **Peer mesh**: a bounded pool of mutually authenticated TLS links to
//!   other server nodes, with keepalive probing and reconnection under
//!   exponential backoff with jitter
//! - **Framing**: a 6-byte header (type + length, big-endian) with a closed
//!   set of frame types and a hard cap on frame size
//! - **Client pool**: a bounded registry of client connections with
//!   concurrent broadcast and idle eviction
//! - **State notifications**: observers for peer presence changes
//!
//! ## Feature Flags
//!
//! - `mesh` (default): Peer pool, TLS dialing and backoff
//! - `server` (default): Client socket pool
//! - `yaml` (default): Loading [`core::MeshConfig`] from YAML files
//!
//! ## Modules
//!
//! - [`core`]: Configuration, errors, identifiers and constants (always included)
//! - [`transport`]: Frames, peer links and TLS (always included; TLS requires `mesh`)
//! - [`mesh`]: Peer pool and notifier (requires `mesh` feature)
//! - [`server`]: Client socket pool (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```no_run
//! use meshlink::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), MeshError> {
//!     let config = PeerPoolConfig::builder()
//!         .max_peers(16)
//!         .tls(TlsFiles::new("node.crt", "node.key", "ca.crt"))
//!         .build();
//!     let peers = PeerPool::new(config)?;
//!
//!     peers.notifier().subscribe(|peer: &PeerIdentity, state: PeerLinkState| {
//!         println!("{peer} -> {state}");
//!     });
//!
//!     let identity = PeerIdentity::new(PeerId::generate(), "10.0.0.2", 7400)
//!         .with_display_name("node-b");
//!     let link = peers.dial_and_register(identity).await?;
//!     link.send(FrameType::Data, b"hello").await?;
//!
//!     peers.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Framing and peer links (always included)
pub mod transport;

// Peer mesh (feature-gated)
#[cfg(feature = "mesh")]
#[cfg_attr(docsrs, doc(cfg(feature = "mesh")))]
pub mod mesh;

// Client socket pool (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::transport::{
        Frame, FrameType, LinkMetricsSnapshot, PeerIdentity, PeerLink, PeerLinkState,
        TransportError, TransportResult,
    };

    #[cfg(feature = "mesh")]
    pub use crate::mesh::{PeerNotifier, PeerPool, PeerPoolMetrics, SubscriptionId};
    #[cfg(feature = "mesh")]
    pub use crate::transport::{PeerDialer, TlsDialer};

    #[cfg(feature = "server")]
    pub use crate::server::{ClientSession, ClientSocketPool, SocketPoolMetrics};
}

// Re-export commonly used items at crate root
pub use crate::core::{ClientId, MeshError, MeshResult, PeerId};

#[cfg(feature = "mesh")]
pub use mesh::{PeerNotifier, PeerPool};

#[cfg(feature = "server")]
pub use server::ClientSocketPool;

pub use transport::{FrameType, PeerIdentity, PeerLinkState};
