//! Pool configuration.
//!
//! Both pools take their configuration by value at construction. Durations
//! are written as human-readable strings ("5s", "250ms") when loaded from a
//! file:
//!
//! ```yaml
//! peer_pool:
//!   max_peers: 16
//!   dial_timeout: 3s
//!   handshake_timeout: 3s
//!   reconnect:
//!     base_delay: 500ms
//!     max_delay: 30s
//!     max_attempts: 8
//!     jitter_factor: 0.2
//!   tls:
//!     cert_file: /etc/mesh/node.crt
//!     key_file: /etc/mesh/node.key
//!     ca_file: /etc/mesh/ca.crt
//!   max_frame_size: 1048576
//!   keepalive_interval: 15s
//! socket_pool:
//!   max_connections: 1000
//!   inactive_timeout: 5m
//!   health_check_interval: 30s
//!   write_timeout: 2s
//! ```

#[cfg(feature = "yaml")]
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants::*;
use super::error::ConfigError;

/// Reconnection backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    #[serde(with = "humantime_duration")]
    pub base_delay: Duration,

    /// Upper bound on the pre-jitter delay.
    #[serde(with = "humantime_duration")]
    pub max_delay: Duration,

    /// Attempts before the peer is marked DISCONNECTED for good.
    pub max_attempts: u32,

    /// Relative jitter band, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Durations must be non-zero and at most [`MAX_CONFIGURED_DURATION`].
fn check_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(field, "must be non-zero"));
    }
    if value > MAX_CONFIGURED_DURATION {
        return Err(ConfigError::invalid(
            field,
            format!(
                "{} exceeds {}",
                humantime::format_duration(value),
                humantime::format_duration(MAX_CONFIGURED_DURATION)
            ),
        ));
    }
    Ok(())
}

impl ReconnectConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("peer_pool.reconnect.base_delay", self.base_delay)?;
        check_duration("peer_pool.reconnect.max_delay", self.max_delay)?;
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "peer_pool.reconnect.base_delay",
                format!(
                    "{} exceeds max_delay {}",
                    humantime::format_duration(self.base_delay),
                    humantime::format_duration(self.max_delay)
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid(
                "peer_pool.reconnect.jitter_factor",
                format!("{} is outside [0, 1]", self.jitter_factor),
            ));
        }
        Ok(())
    }
}

/// Certificate material for mutual TLS between mesh nodes.
///
/// All files are PEM encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsFiles {
    /// This node's certificate chain.
    pub cert_file: PathBuf,

    /// Private key matching `cert_file`.
    pub key_file: PathBuf,

    /// CA bundle used to verify the other side.
    pub ca_file: PathBuf,

    /// Name to verify in the server certificate. Defaults to the peer address.
    pub server_name: Option<String>,
}

impl TlsFiles {
    /// Create TLS file paths.
    pub fn new(
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
        ca_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_file: ca_file.into(),
            server_name: None,
        }
    }

    /// Override the name checked against the server certificate.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Peer pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerPoolConfig {
    /// Maximum number of peer entries (pending dials included).
    pub max_peers: usize,

    /// TCP connect timeout.
    #[serde(with = "humantime_duration")]
    pub dial_timeout: Duration,

    /// TLS handshake timeout.
    #[serde(with = "humantime_duration")]
    pub handshake_timeout: Duration,

    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,

    /// Certificate material.
    pub tls: TlsFiles,

    /// Read buffer capacity per link.
    pub buffer_size: usize,

    /// Largest frame payload accepted or sent.
    pub max_frame_size: usize,

    /// Interval between keepalive rounds.
    #[serde(with = "humantime_duration")]
    pub keepalive_interval: Duration,

    /// Polling interval of an idle reconnection monitor.
    #[serde(with = "humantime_duration")]
    pub monitor_interval: Duration,
}

impl Default for PeerPoolConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            tls: TlsFiles::default(),
            buffer_size: DEFAULT_FRAME_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

impl PeerPoolConfig {
    /// Start a builder seeded with defaults.
    pub fn builder() -> PeerPoolConfigBuilder {
        PeerPoolConfigBuilder::new()
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::invalid("peer_pool.max_peers", "must be non-zero"));
        }
        check_duration("peer_pool.dial_timeout", self.dial_timeout)?;
        check_duration("peer_pool.handshake_timeout", self.handshake_timeout)?;
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("peer_pool.buffer_size", "must be non-zero"));
        }
        if self.max_frame_size == 0 || self.max_frame_size as u64 > u32::MAX as u64 {
            return Err(ConfigError::invalid(
                "peer_pool.max_frame_size",
                format!("{} is outside 1..={}", self.max_frame_size, u32::MAX),
            ));
        }
        check_duration("peer_pool.keepalive_interval", self.keepalive_interval)?;
        check_duration("peer_pool.monitor_interval", self.monitor_interval)?;
        self.reconnect.validate()
    }
}

/// Builder for [`PeerPoolConfig`].
#[derive(Debug, Default)]
pub struct PeerPoolConfigBuilder {
    config: PeerPoolConfig,
}

impl PeerPoolConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of peers.
    pub fn max_peers(mut self, max: usize) -> Self {
        self.config.max_peers = max;
        self
    }

    /// Set the TCP connect timeout.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// Set the TLS handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the reconnection backoff.
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Set the certificate material.
    pub fn tls(mut self, tls: TlsFiles) -> Self {
        self.config.tls = tls;
        self
    }

    /// Set the per-link read buffer capacity.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the maximum frame payload size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the keepalive interval.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the idle monitor polling interval.
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor_interval = interval;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PeerPoolConfig {
        self.config
    }
}

/// Client socket pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientPoolConfig {
    /// Maximum number of client sessions.
    pub max_connections: usize,

    /// Idle time after which a session is reaped.
    #[serde(with = "humantime_duration")]
    pub inactive_timeout: Duration,

    /// Interval between health-check sweeps.
    #[serde(with = "humantime_duration")]
    pub health_check_interval: Duration,

    /// Read buffer capacity per session.
    pub buffer_size: usize,

    /// Per-recipient broadcast write timeout.
    #[serde(with = "humantime_duration")]
    pub write_timeout: Duration,
}

impl Default for ClientPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            inactive_timeout: DEFAULT_INACTIVE_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            buffer_size: DEFAULT_CLIENT_BUFFER_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl ClientPoolConfig {
    /// Start a builder seeded with defaults.
    pub fn builder() -> ClientPoolConfigBuilder {
        ClientPoolConfigBuilder::new()
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(
                "socket_pool.max_connections",
                "must be non-zero",
            ));
        }
        check_duration("socket_pool.inactive_timeout", self.inactive_timeout)?;
        check_duration("socket_pool.health_check_interval", self.health_check_interval)?;
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("socket_pool.buffer_size", "must be non-zero"));
        }
        check_duration("socket_pool.write_timeout", self.write_timeout)
    }
}

/// Builder for [`ClientPoolConfig`].
#[derive(Debug, Default)]
pub struct ClientPoolConfigBuilder {
    config: ClientPoolConfig,
}

impl ClientPoolConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of client sessions.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the inactivity threshold.
    pub fn inactive_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactive_timeout = timeout;
        self
    }

    /// Set the health-check interval.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Set the per-session read buffer capacity.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the broadcast write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientPoolConfig {
        self.config
    }
}

/// Configuration file root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Peer mesh settings.
    pub peer_pool: PeerPoolConfig,

    /// Client socket pool settings.
    pub socket_pool: ClientPoolConfig,
}

impl MeshConfig {
    /// Parse and validate a YAML document.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Check value ranges of both sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.peer_pool.validate()?;
        self.socket_pool.validate()
    }
}

/// Serde adapter for durations written as "5s", "250ms", "1m 30s".
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PeerPoolConfig::default().validate().is_ok());
        assert!(ClientPoolConfig::default().validate().is_ok());
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn test_peer_builder() {
        let config = PeerPoolConfig::builder()
            .max_peers(2)
            .max_frame_size(512)
            .keepalive_interval(Duration::from_millis(100))
            .tls(TlsFiles::new("a.crt", "a.key", "ca.crt").with_server_name("mesh.local"))
            .build();

        assert_eq!(config.max_peers, 2);
        assert_eq!(config.max_frame_size, 512);
        assert_eq!(config.keepalive_interval, Duration::from_millis(100));
        assert_eq!(config.tls.server_name.as_deref(), Some("mesh.local"));
        assert_eq!(config.dial_timeout, DEFAULT_DIAL_TIMEOUT);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = PeerPoolConfig::builder().max_peers(0).build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "peer_pool.max_peers",
                ..
            })
        ));

        let reconnect = ReconnectConfig {
            jitter_factor: 1.5,
            ..ReconnectConfig::default()
        };
        assert!(reconnect.validate().is_err());

        let reconnect = ReconnectConfig {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(1),
            ..ReconnectConfig::default()
        };
        assert!(reconnect.validate().is_err());

        let config = ClientPoolConfig::builder()
            .write_timeout(Duration::ZERO)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let reconnect = ReconnectConfig {
            max_delay: Duration::from_secs(u64::MAX),
            ..ReconnectConfig::default()
        };
        assert!(matches!(
            reconnect.validate(),
            Err(ConfigError::Invalid {
                field: "peer_pool.reconnect.max_delay",
                ..
            })
        ));

        let config = PeerPoolConfig::builder()
            .keepalive_interval(MAX_CONFIGURED_DURATION + Duration::from_secs(1))
            .build();
        assert!(config.validate().is_err());

        let config = ClientPoolConfig::builder()
            .health_check_interval(Duration::from_secs(u64::MAX))
            .build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "socket_pool.health_check_interval",
                ..
            })
        ));

        let config = ClientPoolConfig::builder()
            .inactive_timeout(MAX_CONFIGURED_DURATION)
            .build();
        assert!(config.validate().is_ok());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_yaml_partial_document_uses_defaults() {
        let yaml = r#"
peer_pool:
  max_peers: 3
  dial_timeout: 250ms
  reconnect:
    base_delay: 1s
    max_delay: 1m
    max_attempts: 4
    jitter_factor: 0.1
  tls:
    cert_file: node.crt
    key_file: node.key
    ca_file: ca.crt
    server_name: peer.mesh
socket_pool:
  max_connections: 10
  inactive_timeout: 2m 30s
"#;
        let config = MeshConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.peer_pool.max_peers, 3);
        assert_eq!(config.peer_pool.dial_timeout, Duration::from_millis(250));
        assert_eq!(config.peer_pool.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(config.peer_pool.reconnect.max_attempts, 4);
        assert_eq!(config.peer_pool.tls.ca_file, PathBuf::from("ca.crt"));
        assert_eq!(config.peer_pool.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.socket_pool.max_connections, 10);
        assert_eq!(config.socket_pool.inactive_timeout, Duration::from_secs(150));
        assert_eq!(config.socket_pool.write_timeout, DEFAULT_WRITE_TIMEOUT);
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_yaml_rejects_bad_duration_and_invalid_values() {
        let bad_duration = "peer_pool:\n  dial_timeout: soon\n";
        assert!(matches!(
            MeshConfig::from_yaml_str(bad_duration),
            Err(ConfigError::Yaml(_))
        ));

        let zero_peers = "peer_pool:\n  max_peers: 0\n";
        assert!(matches!(
            MeshConfig::from_yaml_str(zero_peers),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_yaml_file_roundtrip() {
        use std::io::Write;

        let original = MeshConfig::default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_yaml::to_string(&original).unwrap().as_bytes())
            .unwrap();

        let loaded = MeshConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(loaded, original);
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_yaml_missing_file() {
        let err = MeshConfig::from_yaml_file("/nonexistent/mesh.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
