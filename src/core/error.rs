//! Error types for the mesh and the client socket pool.

use thiserror::Error;

use super::ids::{ClientId, PeerId};
use crate::transport::TransportError;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration document is malformed.
    #[cfg(feature = "yaml")]
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A field holds a value outside its allowed range.
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level errors returned by pool operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The pool is at capacity. Never retried automatically.
    #[error("pool full: capacity of {capacity} reached")]
    PoolFull {
        /// Configured maximum size of the pool.
        capacity: usize,
    },

    /// Another dial for the same peer has not finished yet.
    #[error("dial already in progress for peer {0}")]
    DialInProgress(PeerId),

    /// Dial, handshake, read or write failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broadcast was asked to send nothing.
    #[error("refusing to broadcast an empty payload")]
    EmptyPayload,

    /// Some recipients of a broadcast could not be written to.
    #[error("broadcast failed for {failed} client(s)")]
    BroadcastFailed {
        /// Number of recipients that did not receive the payload.
        failed: usize,
        /// The recipients that did not receive the payload.
        clients: Vec<ClientId>,
    },

    /// The pool has been shut down.
    #[error("pool shut down")]
    Shutdown,
}

impl MeshError {
    /// Whether this is an admission-control rejection.
    ///
    /// Callers use this to tell "pool full" apart from transient transport
    /// failures.
    pub fn is_admission_denied(&self) -> bool {
        matches!(self, MeshError::PoolFull { .. })
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::Transport(e) => e.is_retryable(),
            MeshError::DialInProgress(_) | MeshError::BroadcastFailed { .. } => true,
            MeshError::PoolFull { .. }
            | MeshError::Config(_)
            | MeshError::EmptyPayload
            | MeshError::Shutdown => false,
        }
    }
}

/// Result type for pool operations.
pub type MeshResult<T> = Result<T, MeshError>;
