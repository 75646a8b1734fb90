//! Mutual TLS for peer links.
//!
//! Both directions present a certificate and verify the other side against
//! the same CA bundle. Only TLS 1.2 and 1.3 with the `ring` provider are
//! offered.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, client};
use tracing::debug;

use super::error::{TransportError, TransportResult};
use super::link::PeerIdentity;
use crate::core::{PeerPoolConfig, TlsFiles};

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str, err: impl fmt::Display) -> TransportError {
    TransportError::Tls(format!("{context}: {err}"))
}

/// Load every certificate in a PEM file.
pub fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let context = path.display().to_string();
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| tls_error(&context, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(&context, e))?;

    if certs.is_empty() {
        return Err(tls_error(&context, "no certificates found"));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| tls_error(&path.display().to_string(), e))
}

/// Load a CA bundle into a root store.
pub fn load_roots(path: &Path) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| tls_error(&path.display().to_string(), e))?;
    }
    Ok(roots)
}

/// Client side configuration: our certificate plus the CA to verify servers.
pub fn client_config(files: &TlsFiles) -> TransportResult<Arc<rustls::ClientConfig>> {
    let roots = load_roots(&files.ca_file)?;
    let certs = load_certs(&files.cert_file)?;
    let key = load_private_key(&files.key_file)?;

    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| tls_error("client config", e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error("client certificate", e))?;

    Ok(Arc::new(config))
}

/// Server side configuration. Clients without a certificate signed by the
/// CA are rejected during the handshake.
pub fn server_config(files: &TlsFiles) -> TransportResult<Arc<rustls::ServerConfig>> {
    let roots = load_roots(&files.ca_file)?;
    let certs = load_certs(&files.cert_file)?;
    let key = load_private_key(&files.key_file)?;

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .map_err(|e| tls_error("client verifier", e))?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| tls_error("server config", e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| tls_error("server certificate", e))?;

    Ok(Arc::new(config))
}

/// Acceptor for inbound peer connections.
pub fn acceptor(files: &TlsFiles) -> TransportResult<TlsAcceptor> {
    Ok(TlsAcceptor::from(server_config(files)?))
}

/// Establishes authenticated streams to peers.
///
/// The peer pool is generic over this trait so that tests can substitute
/// in-memory streams for TLS over TCP.
pub trait PeerDialer: Send + Sync + 'static {
    /// Stream produced by a successful dial.
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Connect and authenticate to `peer`.
    fn dial(&self, peer: &PeerIdentity)
    -> impl Future<Output = TransportResult<Self::Stream>> + Send;
}

/// Dials peers over TCP and performs a mutual TLS handshake.
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
    server_name: Option<String>,
    dial_timeout: Duration,
    handshake_timeout: Duration,
}

impl TlsDialer {
    /// Build a dialer from the pool's TLS files and timeouts.
    pub fn new(config: &PeerPoolConfig) -> TransportResult<Self> {
        Ok(Self::with_client_config(
            client_config(&config.tls)?,
            config.dial_timeout,
            config.handshake_timeout,
        )
        .with_server_name(config.tls.server_name.clone()))
    }

    /// Build a dialer around an existing client configuration.
    pub fn with_client_config(
        config: Arc<rustls::ClientConfig>,
        dial_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            connector: TlsConnector::from(config),
            server_name: None,
            dial_timeout,
            handshake_timeout,
        }
    }

    /// Verify this name instead of the peer address.
    pub fn with_server_name(mut self, name: Option<String>) -> Self {
        self.server_name = name;
        self
    }
}

impl fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsDialer")
            .field("server_name", &self.server_name)
            .field("dial_timeout", &self.dial_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl PeerDialer for TlsDialer {
    type Stream = client::TlsStream<TcpStream>;

    async fn dial(&self, peer: &PeerIdentity) -> TransportResult<Self::Stream> {
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| peer.address.clone());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TransportError::InvalidServerName(name))?;

        let endpoint = peer.endpoint();
        let tcp = timeout(self.dial_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| TransportError::DialTimeout)??;
        tcp.set_nodelay(true)?;

        let stream = timeout(
            self.handshake_timeout,
            self.connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
        .map_err(|e| tls_error("handshake", e))?;

        debug!(peer = %peer, %endpoint, "tls handshake complete");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PeerId;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_files_rejected() {
        let files = TlsFiles::new(
            "/nonexistent/node.crt",
            "/nonexistent/node.key",
            "/nonexistent/ca.crt",
        );
        assert!(matches!(client_config(&files), Err(TransportError::Tls(_))));
        assert!(matches!(server_config(&files), Err(TransportError::Tls(_))));
    }

    #[test]
    fn test_file_without_certificates_rejected() {
        let file = pem_file("not a certificate\n");
        let err = load_certs(file.path()).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
        assert!(load_private_key(file.path()).is_err());
    }

    #[tokio::test]
    async fn test_invalid_server_name_fails_before_connecting() {
        let roots = RootCertStore::empty();
        let config = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let dialer = TlsDialer::with_client_config(
            Arc::new(config),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );

        let peer = PeerIdentity::new(PeerId::generate(), "not a host name!", 1);
        let err = dialer.dial(&peer).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidServerName(_)));
        assert!(!err.is_retryable());
    }
}
