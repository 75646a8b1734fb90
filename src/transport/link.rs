//! Framed, authenticated link to a single mesh peer.
//!
//! A [`PeerLink`] owns one byte stream (normally a mutually authenticated
//! TLS session) and exchanges length-prefixed frames over it. Sends are
//! serialized by a writer lock and receives by a reader lock, so one send
//! and one receive may be in flight at the same time, but never two of the
//! same kind.
//!
//! Closing is idempotent. The first call cancels any pending receive, sends
//! a best-effort CLOSE frame, moves the link to
//! [`PeerLinkState::Disconnected`] and shuts the stream down. Later calls
//! return immediately.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf, split,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::{TransportError, TransportResult};
use super::frame::{self, Frame, FrameError, FrameType};
use crate::core::{
    DEFAULT_FRAME_BUFFER_SIZE, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, LINK_READ_DEADLINE,
    LINK_WRITE_DEADLINE, PeerId, PeerStateObserver,
};

/// Identity of a mesh peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Unique peer identifier. Key of the peer pool.
    pub id: PeerId,
    /// Host name or IP address to dial.
    pub address: String,
    /// TCP port to dial.
    pub port: u16,
    /// Human readable name.
    pub display_name: String,
    /// Public key advertised by the peer, opaque to the transport.
    pub public_key: String,
}

impl PeerIdentity {
    /// Create an identity; the display name defaults to the endpoint.
    pub fn new(id: PeerId, address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            id,
            display_name: format!("{address}:{port}"),
            address,
            port,
            public_key: String::new(),
        }
    }

    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the advertised public key.
    pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = key.into();
        self
    }

    /// `address:port`, suitable for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.display_name, self.address, self.port)
    }
}

/// Lifecycle state of a peer link.
///
/// `Connected -> Disconnected` on close, `Disconnected -> Reconnecting`
/// while the pool retries, `Reconnecting -> Disconnected` once retries
/// are exhausted. A successful reconnect installs a new link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum PeerLinkState {
    /// Handshake completed; the link is usable.
    Connected = 0,
    /// The pool is trying to re-establish the link.
    Reconnecting = 1,
    /// The link is closed.
    Disconnected = 2,
}

impl PeerLinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }

    /// Upper-case state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for PeerLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live traffic counters of a link.
///
/// Counters are lock-free; only the last error string takes a lock.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
    rtt_total_nanos: AtomicU64,
    rtt_samples: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl LinkMetrics {
    fn record_sent(&self, bytes: usize, rtt: Option<Duration>) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(rtt) = rtt {
            let nanos = u64::try_from(rtt.as_nanos()).unwrap_or(u64::MAX);
            self.rtt_total_nanos.fetch_add(nanos, Ordering::Relaxed);
            self.rtt_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, err: &TransportError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = Some(err.to_string());
    }

    /// Count one reconnection attempt.
    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the retries counted by the link this one replaces.
    pub(crate) fn carry_retries(&self, previous: &LinkMetrics) {
        self.retries
            .fetch_add(previous.retries.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Mean duration of DATA sends.
    ///
    /// This is the time to hand a frame to the stream, not a network
    /// round trip; the link has no acknowledgment protocol.
    pub fn avg_rtt(&self) -> Duration {
        let samples = self.rtt_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rtt_total_nanos.load(Ordering::Relaxed) / samples)
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        LinkMetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            avg_rtt_micros: u64::try_from(self.avg_rtt().as_micros()).unwrap_or(u64::MAX),
            last_error,
        }
    }
}

/// Point-in-time copy of [`LinkMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkMetricsSnapshot {
    /// Bytes written, headers included.
    pub bytes_sent: u64,
    /// Bytes read, headers included.
    pub bytes_received: u64,
    /// Frames written.
    pub messages_sent: u64,
    /// Frames read.
    pub messages_received: u64,
    /// Reconnection attempts made for this peer, carried across the links
    /// that replace one another.
    pub retries: u64,
    /// Failed sends and receives.
    pub errors: u64,
    /// Mean DATA send duration in microseconds.
    pub avg_rtt_micros: u64,
    /// Message of the most recent error.
    pub last_error: Option<String>,
}

/// Builder for [`PeerLink`].
pub struct PeerLinkBuilder {
    identity: PeerIdentity,
    max_frame_size: usize,
    buffer_size: usize,
    observer: Option<Arc<dyn PeerStateObserver>>,
}

impl PeerLinkBuilder {
    /// Largest payload accepted in either direction.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Capacity of the read buffer.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Observer called on every state transition. Set once.
    pub fn on_state_change(mut self, observer: Arc<dyn PeerStateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Wrap an established stream. The link starts `Connected`.
    pub fn build<S>(self, stream: S) -> PeerLink<S>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = split(stream);
        let now = Instant::now();
        PeerLink {
            identity: self.identity,
            reader: AsyncMutex::new(Some(BufReader::with_capacity(
                self.buffer_size.max(FRAME_HEADER_SIZE),
                read_half,
            ))),
            writer: AsyncMutex::new(Some(write_half)),
            state: AtomicU8::new(PeerLinkState::Connected as u8),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            metrics: LinkMetrics::default(),
            created_at: now,
            last_activity_ms: AtomicU64::new(0),
            max_frame_size: self.max_frame_size,
            observer: self.observer,
        }
    }
}

/// A framed connection to one peer.
pub struct PeerLink<S> {
    identity: PeerIdentity,
    reader: AsyncMutex<Option<BufReader<ReadHalf<S>>>>,
    writer: AsyncMutex<Option<WriteHalf<S>>>,
    state: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    metrics: LinkMetrics,
    created_at: Instant,
    /// Milliseconds since `created_at`.
    last_activity_ms: AtomicU64,
    max_frame_size: usize,
    observer: Option<Arc<dyn PeerStateObserver>>,
}

impl PeerLink<()> {
    /// Start building a link for `identity`.
    pub fn builder(identity: PeerIdentity) -> PeerLinkBuilder {
        PeerLinkBuilder {
            identity,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            buffer_size: DEFAULT_FRAME_BUFFER_SIZE,
            observer: None,
        }
    }
}

impl<S> PeerLink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Peer identity.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Peer identifier.
    pub fn id(&self) -> PeerId {
        self.identity.id
    }

    /// Current state.
    pub fn state(&self) -> PeerLinkState {
        PeerLinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Connected and not closed.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.state() == PeerLinkState::Connected
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Largest payload this link sends or accepts.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Traffic counters.
    pub fn metrics(&self) -> &LinkMetrics {
        &self.metrics
    }

    /// Mean DATA send duration. See [`LinkMetrics::avg_rtt`].
    pub fn avg_rtt(&self) -> Duration {
        self.metrics.avg_rtt()
    }

    /// Time of the last successful send or receive.
    pub fn last_activity(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Time since the last successful send or receive.
    pub fn idle_time(&self) -> Duration {
        self.last_activity().elapsed()
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Move to `state`, notifying the observer if the state changed.
    ///
    /// Only the peer pool drives transitions besides `close`.
    pub(crate) fn set_state(&self, state: PeerLinkState) {
        let previous = PeerLinkState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous == state {
            return;
        }
        debug!(peer = %self.identity, from = %previous, to = %state, "peer link state changed");
        if let Some(observer) = &self.observer {
            observer.on_state_change(&self.identity, state);
        }
    }

    /// Send one frame.
    ///
    /// Fails with [`TransportError::ConnectionClosed`] after `close`, and with
    /// [`FrameError::PayloadTooLarge`] without writing anything if `payload`
    /// exceeds the maximum frame size. The write is bounded by a 10 second
    /// deadline.
    pub async fn send(&self, frame_type: FrameType, payload: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if payload.len() > self.max_frame_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            }
            .into());
        }
        self.write_frame(frame_type, payload).await
    }

    async fn write_frame(&self, frame_type: FrameType, payload: &[u8]) -> TransportResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        let bytes = frame::encode(frame_type, payload);
        let started = Instant::now();
        let written = timeout(LINK_WRITE_DEADLINE, async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        })
        .await;

        let result = match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::WriteTimeout),
        };

        match result {
            Ok(()) => {
                let rtt = (frame_type == FrameType::Data).then(|| started.elapsed());
                self.metrics.record_sent(bytes.len(), rtt);
                self.touch();
                trace!(peer = %self.identity, %frame_type, len = payload.len(), "frame sent");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error(&e);
                Err(e)
            }
        }
    }

    /// Receive one frame.
    ///
    /// Blocks until a whole frame arrives, the 10 second read deadline
    /// passes, or the link is closed. A declared length above the maximum
    /// frame size fails before any payload is read.
    pub async fn receive(&self) -> TransportResult<Frame> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            read = timeout(LINK_READ_DEADLINE, frame::read_frame(reader, self.max_frame_size)) => {
                read.unwrap_or(Err(TransportError::ReadTimeout))
            }
        };

        match result {
            Ok(frame) => {
                self.metrics.record_received(frame.wire_len());
                self.touch();
                trace!(
                    peer = %self.identity,
                    frame_type = %frame.frame_type,
                    len = frame.payload.len(),
                    "frame received"
                );
                Ok(frame)
            }
            Err(e) => {
                if !e.is_closed() {
                    self.metrics.record_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Close the link.
    ///
    /// Safe to call any number of times from any number of tasks; only the
    /// first call does work. Always returns `Ok(())`: the CLOSE frame and the
    /// stream shutdown are best-effort and their failures are only logged.
    pub async fn close(&self) -> TransportResult<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        self.cancel.cancel();

        if let Err(e) = self.write_frame(FrameType::Close, &[]).await {
            debug!(peer = %self.identity, error = %e, "failed to send close frame");
        }

        self.set_state(PeerLinkState::Disconnected);

        if let Some(mut writer) = self.writer.lock().await.take() {
            match timeout(LINK_WRITE_DEADLINE, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(peer = %self.identity, error = %e, "error shutting down peer stream");
                }
                Err(_) => debug!(peer = %self.identity, "peer stream shutdown timed out"),
            }
        }
        self.reader.lock().await.take();

        debug!(peer = %self.identity, "peer link closed");
        Ok(())
    }
}

impl<S> fmt::Debug for PeerLink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("identity", &self.identity)
            .field(
                "state",
                &PeerLinkState::from_u8(self.state.load(Ordering::Acquire)),
            )
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, DuplexStream, ReadBuf, duplex};
    use tokio::task::JoinSet;

    fn identity() -> PeerIdentity {
        PeerIdentity::new(PeerId::generate(), "10.0.0.7", 7000).with_display_name("node-7")
    }

    fn link_pair(max_frame_size: usize) -> (PeerLink<DuplexStream>, PeerLink<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let left = PeerLink::builder(identity())
            .max_frame_size(max_frame_size)
            .build(a);
        let right = PeerLink::builder(identity())
            .max_frame_size(max_frame_size)
            .build(b);
        (left, right)
    }

    /// Duplex stream that counts shutdown calls.
    struct CountingStream {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Stream whose peer is gone: reads never complete, writes and
    /// shutdown fail with a reset.
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    #[test]
    fn test_identity_display() {
        let peer = identity();
        assert_eq!(peer.to_string(), "node-7 (10.0.0.7:7000)");
        assert_eq!(peer.endpoint(), "10.0.0.7:7000");

        let unnamed = PeerIdentity::new(PeerId::generate(), "peer.local", 9);
        assert_eq!(unnamed.display_name, "peer.local:9");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PeerLinkState::Connected.to_string(), "CONNECTED");
        assert_eq!(PeerLinkState::Reconnecting.as_str(), "RECONNECTING");
        assert_eq!(PeerLinkState::Disconnected.to_string(), "DISCONNECTED");
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (left, right) = link_pair(1024);
        assert_eq!(left.state(), PeerLinkState::Connected);

        left.send(FrameType::Data, b"state-update").await.unwrap();
        left.send(FrameType::KeepAlive, &[]).await.unwrap();

        let frame = right.receive().await.unwrap();
        assert_eq!(frame, Frame::data(b"state-update".to_vec()));
        let frame = right.receive().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::KeepAlive);
        assert!(frame.payload.is_empty());

        let sent = left.metrics().snapshot();
        assert_eq!(sent.messages_sent, 2);
        assert_eq!(sent.bytes_sent, (FRAME_HEADER_SIZE * 2 + 12) as u64);
        assert_eq!(sent.errors, 0);

        let received = right.metrics().snapshot();
        assert_eq!(received.messages_received, 2);
        assert_eq!(received.bytes_received, sent.bytes_sent);
    }

    #[tokio::test]
    async fn test_oversized_send_writes_nothing() {
        let (left, right) = link_pair(16);

        let err = left.send(FrameType::Data, &[0u8; 17]).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Frame(FrameError::PayloadTooLarge { size: 17, max: 16 })
        ));
        assert_eq!(left.metrics().snapshot().bytes_sent, 0);

        // The next frame on the wire is the valid one.
        left.send(FrameType::Data, &[1u8; 16]).await.unwrap();
        let frame = right.receive().await.unwrap();
        assert_eq!(frame.payload, vec![1u8; 16]);
    }

    #[tokio::test]
    async fn test_oversized_receive_is_protocol_error() {
        let (mut raw, stream) = duplex(1024);
        let link = PeerLink::builder(identity()).max_frame_size(8).build(stream);

        raw.write_all(&frame::encode(FrameType::Data, &[0u8; 32]))
            .await
            .unwrap();

        let err = link.receive().await.unwrap_err();
        assert!(err.is_protocol_error());

        let metrics = link.metrics().snapshot();
        assert_eq!(metrics.errors, 1);
        assert!(metrics.last_error.unwrap().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_concurrent_close_is_idempotent() {
        let (stream, mut remote) = duplex(1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let transitions = Arc::new(Mutex::new(Vec::new()));

        let recorded = transitions.clone();
        let observer: Arc<dyn PeerStateObserver> =
            Arc::new(move |_: &PeerIdentity, state: PeerLinkState| {
                recorded.lock().unwrap().push(state);
            });

        let link = Arc::new(
            PeerLink::builder(identity())
                .on_state_change(observer)
                .build(CountingStream {
                    inner: stream,
                    shutdowns: shutdowns.clone(),
                }),
        );

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let link = link.clone();
            set.spawn(async move { link.close().await });
        }
        while let Some(result) = set.join_next().await {
            result.unwrap().unwrap();
        }
        link.close().await.unwrap();

        assert!(link.is_closed());
        assert_eq!(link.state(), PeerLinkState::Disconnected);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(*transitions.lock().unwrap(), vec![PeerLinkState::Disconnected]);

        // The remote sees exactly one CLOSE frame, then end of stream.
        let frame = frame::read_frame(&mut remote, 1024).await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Close);
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (left, _right) = link_pair(1024);
        left.close().await.unwrap();

        assert!(left.send(FrameType::Data, b"late").await.unwrap_err().is_closed());
        assert!(left.receive().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_receive() {
        let (left, _right) = link_pair(1024);
        let left = Arc::new(left);

        let reader = left.clone();
        let pending = tokio::spawn(async move { reader.receive().await });
        tokio::task::yield_now().await;

        left.close().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_closed());
        assert_eq!(left.metrics().snapshot().errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_deadline() {
        let (left, _right) = link_pair(1024);
        let err = left.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::ReadTimeout));
        assert!(left.idle_time() >= LINK_READ_DEADLINE);
    }

    #[tokio::test]
    async fn test_state_changes_notify_once() {
        let (stream, _remote) = duplex(1024);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let link = PeerLink::builder(identity())
            .on_state_change(Arc::new(move |_: &PeerIdentity, _: PeerLinkState| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .build(stream);

        link.set_state(PeerLinkState::Reconnecting);
        link.set_state(PeerLinkState::Reconnecting);
        link.set_state(PeerLinkState::Disconnected);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_on_reset_stream_succeeds() {
        let link = PeerLink::builder(identity()).build(ResetStream);

        assert!(link.send(FrameType::KeepAlive, &[]).await.is_err());
        link.close().await.unwrap();
        link.close().await.unwrap();

        assert!(link.is_closed());
        assert_eq!(link.state(), PeerLinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_receive_pending() {
        let (left, right) = link_pair(1024);
        let left = Arc::new(left);

        let reader = left.clone();
        let pending = tokio::spawn(async move { reader.receive().await });
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(1), left.send(FrameType::Data, b"ping"))
            .await
            .expect("send blocked behind a pending receive")
            .unwrap();
        let frame = right.receive().await.unwrap();
        assert_eq!(frame.payload, b"ping".to_vec());
        assert!(!pending.is_finished());

        left.close().await.unwrap();
        assert!(pending.await.unwrap().unwrap_err().is_closed());
    }
}
