//! Bounded registry of client connections.
//!
//! The pool admits up to `max_connections` sessions keyed by [`ClientId`],
//! fans payloads out to many clients at once, and sweeps sessions idle for
//! longer than `inactive_timeout`. Every removal (release, replacement,
//! sweep, broadcast failure or shutdown) closes the session and reports the
//! client id to the closed-connection callback on a separate task.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, Weak};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::session::ClientSession;
use crate::core::{ClientId, ClientPoolConfig, MeshError, MeshResult};

/// Callback invoked with the id of every connection the pool closes.
pub type ClosedCallback = Arc<dyn Fn(ClientId) + Send + Sync>;

/// Socket pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SocketPoolMetrics {
    /// Registered sessions.
    pub active_connections: usize,
    /// Configured capacity.
    pub max_connections: usize,
    /// `active_connections / max_connections` as a percentage.
    pub utilization_pct: f64,
}

struct SocketPoolInner<S> {
    config: ClientPoolConfig,
    sessions: RwLock<HashMap<ClientId, Arc<ClientSession<S>>>>,
    on_closed: StdRwLock<Option<ClosedCallback>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Pool of client connections. Cheap to clone; clones share state.
pub struct ClientSocketPool<S = TcpStream> {
    inner: Arc<SocketPoolInner<S>>,
}

impl<S> Clone for ClientSocketPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> ClientSocketPool<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a pool and start its idle sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientPoolConfig) -> MeshResult<Self> {
        config.validate()?;

        let inner = Arc::new(SocketPoolInner {
            config,
            sessions: RwLock::new(HashMap::new()),
            on_closed: StdRwLock::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        inner.spawn_health_check();

        info!(
            max_connections = inner.config.max_connections,
            inactive_timeout = ?inner.config.inactive_timeout,
            "client socket pool started"
        );
        Ok(Self { inner })
    }

    /// Set the closed-connection callback, replacing any previous one.
    pub fn set_on_connection_closed<F>(&self, callback: F)
    where
        F: Fn(ClientId) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_closed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Register a client connection.
    ///
    /// An existing session with the same id is closed and replaced. When
    /// the pool is full the stream is dropped, which closes it.
    pub async fn register(&self, id: ClientId, stream: S) -> MeshResult<Arc<ClientSession<S>>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(MeshError::Shutdown);
        }

        let session = Arc::new(ClientSession::new(id, stream, self.inner.config.buffer_size));
        let (replaced, admitted) = {
            let mut sessions = self.inner.sessions.write().await;
            let replaced = sessions.remove(&id);
            let admitted = sessions.len() < self.inner.config.max_connections;
            if admitted {
                sessions.insert(id, session.clone());
            }
            (replaced, admitted)
        };

        if let Some(old) = replaced {
            debug!(client = %id, "replacing existing client session");
            self.inner.close_session(&old).await;
        }

        if !admitted {
            warn!(
                client = %id,
                capacity = self.inner.config.max_connections,
                "client socket pool full"
            );
            return Err(MeshError::PoolFull {
                capacity: self.inner.config.max_connections,
            });
        }

        session.touch();
        debug!(client = %id, "client registered");
        Ok(session)
    }

    /// Look up a session, refreshing its activity time.
    pub async fn get(&self, id: &ClientId) -> Option<Arc<ClientSession<S>>> {
        let session = self.inner.sessions.read().await.get(id).cloned()?;
        session.touch();
        Some(session)
    }

    /// Whether a session is registered.
    pub async fn contains(&self, id: &ClientId) -> bool {
        self.inner.sessions.read().await.contains_key(id)
    }

    /// Remove and close a session. Returns whether it was registered.
    pub async fn release(&self, id: &ClientId) -> bool {
        self.inner.release(id).await
    }

    /// Write `payload` to every client in `ids` concurrently.
    ///
    /// Each write is bounded by the configured write timeout. Clients whose
    /// write fails because the connection is gone are released. Returns
    /// [`MeshError::BroadcastFailed`] naming every recipient that did not
    /// get the payload, unknown ids included.
    pub async fn broadcast(&self, ids: &[ClientId], payload: &[u8]) -> MeshResult<()> {
        if payload.is_empty() {
            return Err(MeshError::EmptyPayload);
        }

        let targets: Vec<(ClientId, Option<Arc<ClientSession<S>>>)> = {
            let sessions = self.inner.sessions.read().await;
            ids.iter().map(|id| (*id, sessions.get(id).cloned())).collect()
        };

        let payload: Arc<[u8]> = Arc::from(payload);
        let write_timeout = self.inner.config.write_timeout;
        let mut failed = Vec::new();
        let mut writers = JoinSet::new();
        let mut task_owner = HashMap::new();

        for (id, session) in targets {
            let Some(session) = session else {
                debug!(client = %id, "broadcast target not registered");
                failed.push(id);
                continue;
            };
            let payload = payload.clone();
            let handle = writers.spawn(async move {
                let result = session.write_all(&payload, write_timeout).await;
                (id, result)
            });
            task_owner.insert(handle.id(), id);
        }

        let mut disconnected = Vec::new();
        while let Some(joined) = writers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    warn!(client = %id, error = %e, "broadcast write failed");
                    failed.push(id);
                    if e.is_disconnect() {
                        disconnected.push(id);
                    }
                }
                Err(join_error) => {
                    error!(error = %join_error, "broadcast writer task failed");
                    if let Some(id) = task_owner.get(&join_error.id()) {
                        failed.push(*id);
                    }
                }
            }
        }

        for id in &disconnected {
            self.inner.release(id).await;
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(MeshError::BroadcastFailed {
                failed: failed.len(),
                clients: failed,
            })
        }
    }

    /// Release every session idle for longer than the inactive timeout.
    ///
    /// Runs on the health-check interval; exposed for callers that want an
    /// immediate sweep. Returns the number of sessions released.
    pub async fn reap_idle(&self) -> usize {
        self.inner.reap_idle().await
    }

    /// Registered session count.
    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Whether no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.read().await.is_empty()
    }

    /// Pool snapshot.
    pub async fn metrics(&self) -> SocketPoolMetrics {
        let active = self.len().await;
        let max = self.inner.config.max_connections;
        SocketPoolMetrics {
            active_connections: active,
            max_connections: max,
            utilization_pct: active as f64 / max as f64 * 100.0,
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &ClientPoolConfig {
        &self.inner.config
    }

    /// Stop the idle sweep and close every session. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();

        let drained: Vec<_> = self.inner.sessions.write().await.drain().collect();
        if !drained.is_empty() {
            info!(sessions = drained.len(), "closing client socket pool");
        }
        self.inner
            .close_sessions(drained.into_iter().map(|(_, session)| session).collect())
            .await;

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl<S> fmt::Debug for ClientSocketPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocketPool")
            .field("max_connections", &self.inner.config.max_connections)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S> SocketPoolInner<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn release(&self, id: &ClientId) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                debug!(client = %id, "releasing client session");
                self.close_session(&session).await;
                true
            }
            None => false,
        }
    }

    async fn reap_idle(self: &Arc<Self>) -> usize {
        let limit = self.config.inactive_timeout;
        let expired: Vec<_> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<ClientId> = sessions
                .iter()
                .filter(|(_, session)| session.idle_time() > limit)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let released = expired.len();
        for session in &expired {
            debug!(client = %session.id(), idle = ?session.idle_time(), "releasing idle client");
        }
        self.close_sessions(expired).await;
        if released > 0 {
            info!(released, "idle client sweep");
        }
        released
    }

    /// Close removed sessions concurrently so one stalled stream does not
    /// hold up the rest.
    async fn close_sessions(self: &Arc<Self>, sessions: Vec<Arc<ClientSession<S>>>) {
        let mut closers = JoinSet::new();
        for session in sessions {
            let pool = self.clone();
            closers.spawn(async move { pool.close_session(&session).await });
        }
        while let Some(joined) = closers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "session close task failed");
            }
        }
    }

    /// Close a session already removed from the map and report it.
    async fn close_session(&self, session: &ClientSession<S>) {
        if !session.close(self.config.write_timeout).await {
            return;
        }
        let callback = self
            .on_closed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            let id = session.id();
            tokio::spawn(async move { callback(id) });
        }
    }

    fn spawn_health_check(self: &Arc<Self>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.health_check_interval;

        self.tasks.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.reap_idle().await;
                    }
                }
            }
            debug!("client health check stopped");
        });
    }
}

impl<S> Drop for SocketPoolInner<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
