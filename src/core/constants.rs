//! Wire and timing constants.
//!
//! The wire values are fixed by the frame format and MUST NOT be changed.
//! The `DEFAULT_*` values only seed [`PeerPoolConfig`](super::PeerPoolConfig)
//! and [`ClientPoolConfig`](super::ClientPoolConfig).

use std::time::Duration;

// =============================================================================
// FRAME FORMAT
// =============================================================================

/// Size of the frame type field (big-endian u16).
pub const FRAME_TYPE_SIZE: usize = 2;

/// Size of the payload length field (big-endian u32).
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Frame header size (type + length).
pub const FRAME_HEADER_SIZE: usize = FRAME_TYPE_SIZE + FRAME_LENGTH_SIZE;

/// Application data frame.
pub const FRAME_TYPE_DATA: u16 = 0x0001;

/// Liveness probe, carries no payload.
pub const FRAME_TYPE_KEEPALIVE: u16 = 0x0002;

/// Positive acknowledgment.
pub const FRAME_TYPE_ACK: u16 = 0x0003;

/// Negative acknowledgment.
pub const FRAME_TYPE_NACK: u16 = 0x0004;

/// Graceful link termination.
pub const FRAME_TYPE_CLOSE: u16 = 0x0005;

// =============================================================================
// LINK DEADLINES
// =============================================================================

/// Deadline applied to every frame write on a peer link.
pub const LINK_WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline applied to every frame read on a peer link.
pub const LINK_READ_DEADLINE: Duration = Duration::from_secs(10);

// =============================================================================
// PEER POOL DEFAULTS
// =============================================================================

/// Maximum number of peer links.
pub const DEFAULT_MAX_PEERS: usize = 50;

/// TCP connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// First reconnection delay.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Reconnection delay ceiling.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Reconnection attempts before a peer is given up.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Relative jitter applied to each reconnection delay.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Read buffer capacity per peer link.
pub const DEFAULT_FRAME_BUFFER_SIZE: usize = 64 * 1024;

/// Largest accepted frame payload (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Interval between keepalive rounds.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// How often an idle monitor re-checks its link.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// CLIENT SOCKET POOL DEFAULTS
// =============================================================================

/// Maximum number of client sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Idle time after which a client session is reaped.
pub const DEFAULT_INACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between health-check sweeps.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Per-recipient write timeout for broadcasts.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read buffer capacity per client session.
pub const DEFAULT_CLIENT_BUFFER_SIZE: usize = 4 * 1024;

/// Upper bound on any configured delay, timeout or interval (one week).
pub const MAX_CONFIGURED_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
