//! Client session held by the socket pool.
//!
//! A session wraps one accepted client stream. Reads and writes each take
//! their own lock, so a reader task and a broadcast can use the session at
//! the same time. Every successful read or write, and every lookup through
//! the pool, refreshes the last-activity time used by the idle sweep.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf, split,
};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::ClientId;
use crate::transport::{TransportError, TransportResult};

/// One client connection.
pub struct ClientSession<S> {
    id: ClientId,
    reader: Mutex<Option<BufReader<ReadHalf<S>>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    created_at: Instant,
    /// Milliseconds since `created_at`.
    last_activity_ms: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a client stream.
    pub fn new(id: ClientId, stream: S, buffer_size: usize) -> Self {
        let (read_half, write_half) = split(stream);
        Self {
            id,
            reader: Mutex::new(Some(BufReader::with_capacity(buffer_size.max(1), read_half))),
            writer: Mutex::new(Some(write_half)),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Client identifier.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Record activity.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time of the last recorded activity.
    pub fn last_activity(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Time since the last recorded activity.
    pub fn idle_time(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write all of `bytes` within `deadline`.
    pub async fn write_all(&self, bytes: &[u8], deadline: Duration) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        match timeout(deadline, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        {
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }

    /// Read available bytes into `buf`. Returns `Ok(0)` at end of stream.
    ///
    /// A pending read returns [`TransportError::ConnectionClosed`] when the
    /// session is closed.
    pub async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        let n = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::ConnectionClosed),
            read = reader.read(buf) => read?,
        };
        if n > 0 {
            self.touch();
        }
        Ok(n)
    }

    /// Close the session, giving the stream shutdown at most `deadline`.
    /// Returns `true` on the first call only.
    pub(crate) async fn close(&self, deadline: Duration) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.cancel.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            match timeout(deadline, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(client = %self.id, error = %e, "error shutting down client stream");
                }
                Err(_) => debug!(client = %self.id, "client stream shutdown timed out"),
            }
        }
        self.reader.lock().await.take();
        true
    }
}

impl<S> fmt::Debug for ClientSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
