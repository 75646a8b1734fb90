//! Bounded pool of peer links with keepalive and reconnection.
//!
//! The pool maps [`PeerId`] to the current [`PeerLink`] of that peer. A
//! background task sends a KEEPALIVE frame to every connected peer each
//! keepalive interval and closes links whose probe fails. Each registered
//! peer has exactly one reconnection monitor, which notices the closed link,
//! redials with exponential backoff and installs the new link. A closed
//! link stays in the map as a tombstone (identity, state and metrics) until
//! it is replaced or explicitly closed through the pool.
//!
//! ```text
//!           dial_and_register ───────────┐
//!                                        ▼
//!   keepalive failure / report_failure   CONNECTED
//!                    │                   ▲
//!                    ▼                   │ redial ok
//!              DISCONNECTED ──► RECONNECTING ──► DISCONNECTED
//!                                 (retry)       (attempts exhausted)
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::notifier::PeerNotifier;
use crate::core::{MeshError, MeshResult, PeerId, PeerPoolConfig};
use crate::transport::{
    Backoff, FrameType, LinkMetricsSnapshot, PeerDialer, PeerIdentity, PeerLink, PeerLinkState,
    TlsDialer, TransportError,
};

type Link<D> = PeerLink<<D as PeerDialer>::Stream>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialMode {
    /// Caller-initiated dial; creates or replaces the entry.
    Fresh,
    /// Monitor redial; only replaces an entry that still exists.
    Reconnect,
}

/// Slot held in the pending-dial set while a dial is in flight.
struct DialReservation<'a> {
    dialing: &'a Mutex<HashSet<PeerId>>,
    id: PeerId,
}

impl Drop for DialReservation<'_> {
    fn drop(&mut self) {
        lock(self.dialing).remove(&self.id);
    }
}

/// Per-peer entry of [`PeerPoolMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct PeerReport {
    /// Peer identity.
    pub identity: PeerIdentity,
    /// Current link state.
    pub state: PeerLinkState,
    /// Milliseconds since the last successful send or receive.
    pub idle_ms: u64,
    /// Traffic counters.
    pub metrics: LinkMetricsSnapshot,
}

/// Pool-wide snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PeerPoolMetrics {
    /// Entries in the pool, tombstones included.
    pub total_peers: usize,
    /// Entries in the CONNECTED state.
    pub connected: usize,
    /// Entries in the RECONNECTING state.
    pub reconnecting: usize,
    /// Entries in the DISCONNECTED state.
    pub disconnected: usize,
    /// Configured capacity.
    pub max_peers: usize,
    /// `total_peers / max_peers` as a percentage.
    pub utilization_pct: f64,
    /// Per-peer detail, ordered by peer id.
    pub peers: Vec<PeerReport>,
}

struct PoolInner<D: PeerDialer> {
    config: PeerPoolConfig,
    dialer: D,
    backoff: Backoff,
    links: RwLock<HashMap<PeerId, Arc<Link<D>>>>,
    dialing: Mutex<HashSet<PeerId>>,
    monitors: Mutex<HashSet<PeerId>>,
    notifier: Arc<PeerNotifier>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Pool of peer links. Cheap to clone; clones share state.
pub struct PeerPool<D: PeerDialer = TlsDialer> {
    inner: Arc<PoolInner<D>>,
}

impl<D: PeerDialer> Clone for PeerPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PeerPool<TlsDialer> {
    /// Create a pool that dials peers over mutual TLS.
    ///
    /// Loads the certificate material named in `config.tls` and starts the
    /// keepalive task, so it must be called from within a Tokio runtime.
    pub fn new(config: PeerPoolConfig) -> MeshResult<Self> {
        config.validate()?;
        let dialer = TlsDialer::new(&config)?;
        Self::with_dialer(config, dialer)
    }
}

impl<D: PeerDialer> PeerPool<D> {
    /// Create a pool around a custom dialer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_dialer(config: PeerPoolConfig, dialer: D) -> MeshResult<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            backoff: Backoff::from_config(&config.reconnect),
            config,
            dialer,
            links: RwLock::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            monitors: Mutex::new(HashSet::new()),
            notifier: Arc::new(PeerNotifier::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        inner.spawn_keepalive();

        info!(
            max_peers = inner.config.max_peers,
            keepalive = ?inner.config.keepalive_interval,
            "peer pool started"
        );
        Ok(Self { inner })
    }

    /// Connect to `identity` and register the link.
    ///
    /// Returns the existing link if the peer is already connected. Fails
    /// with [`MeshError::PoolFull`] before any network I/O when the pool,
    /// counting dials in flight, is at capacity. A successful dial replaces
    /// a stale entry for the same peer and starts its reconnection monitor.
    pub async fn dial_and_register(&self, identity: PeerIdentity) -> MeshResult<Arc<Link<D>>> {
        self.inner.connect(identity, DialMode::Fresh).await
    }

    /// Look up a connected peer.
    pub async fn get(&self, id: &PeerId) -> Option<Arc<Link<D>>> {
        self.inner
            .links
            .read()
            .await
            .get(id)
            .filter(|link| link.is_connected())
            .cloned()
    }

    /// Remove a peer and close its link. Missing peers are not an error.
    pub async fn close(&self, id: &PeerId) -> MeshResult<()> {
        let removed = self.inner.links.write().await.remove(id);
        if let Some(link) = removed {
            info!(peer = %link.identity(), "closing peer link");
            link.close().await?;
        }
        Ok(())
    }

    /// Close every peer.
    pub async fn close_all(&self) {
        let ids: Vec<PeerId> = self.inner.links.read().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                debug!(peer = %id, error = %e, "error closing peer link");
            }
        }
    }

    /// Report a failed link observed by the caller.
    ///
    /// Closes the link but keeps the entry, so the reconnection monitor
    /// redials it.
    pub async fn report_failure(&self, id: &PeerId) {
        let link = self.inner.links.read().await.get(id).cloned();
        if let Some(link) = link.filter(|link| link.is_connected()) {
            warn!(peer = %link.identity(), "peer failure reported, closing link");
            if let Err(e) = link.close().await {
                debug!(peer = %link.identity(), error = %e, "error closing failed link");
            }
        }
    }

    /// Ids of all connected peers.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .links
            .read()
            .await
            .iter()
            .filter(|(_, link)| link.is_connected())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of entries, tombstones included.
    pub async fn len(&self) -> usize {
        self.inner.links.read().await.len()
    }

    /// Whether the pool has no entries.
    pub async fn is_empty(&self) -> bool {
        self.inner.links.read().await.is_empty()
    }

    /// Snapshot pool and per-peer metrics.
    pub async fn metrics(&self) -> PeerPoolMetrics {
        let links = self.inner.links.read().await;
        let max_peers = self.inner.config.max_peers;

        let mut metrics = PeerPoolMetrics {
            total_peers: links.len(),
            connected: 0,
            reconnecting: 0,
            disconnected: 0,
            max_peers,
            utilization_pct: links.len() as f64 / max_peers as f64 * 100.0,
            peers: Vec::with_capacity(links.len()),
        };

        for link in links.values() {
            let state = link.state();
            match state {
                PeerLinkState::Connected => metrics.connected += 1,
                PeerLinkState::Reconnecting => metrics.reconnecting += 1,
                PeerLinkState::Disconnected => metrics.disconnected += 1,
            }
            metrics.peers.push(PeerReport {
                identity: link.identity().clone(),
                state,
                idle_ms: u64::try_from(link.idle_time().as_millis()).unwrap_or(u64::MAX),
                metrics: link.metrics().snapshot(),
            });
        }
        metrics.peers.sort_by_key(|report| report.identity.id);
        metrics
    }

    /// State change notifier. Subscribe here for presence updates.
    pub fn notifier(&self) -> &PeerNotifier {
        &self.inner.notifier
    }

    /// Pool configuration.
    pub fn config(&self) -> &PeerPoolConfig {
        &self.inner.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop background tasks and close every peer.
    ///
    /// Waits for the keepalive task and all monitors to exit. Later dials
    /// fail with [`MeshError::Shutdown`].
    pub async fn shutdown(&self) {
        info!("shutting down peer pool");
        self.inner.shutdown.cancel();
        self.close_all().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("peer pool background tasks stopped");
    }
}

impl<D: PeerDialer> fmt::Debug for PeerPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerPool")
            .field("max_peers", &self.inner.config.max_peers)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<D: PeerDialer> PoolInner<D> {
    async fn connect(self: &Arc<Self>, identity: PeerIdentity, mode: DialMode) -> MeshResult<Arc<Link<D>>> {
        if self.shutdown.is_cancelled() {
            return Err(MeshError::Shutdown);
        }
        let id = identity.id;

        let reservation = {
            let links = self.links.read().await;
            if let Some(link) = links.get(&id).filter(|link| link.is_connected()) {
                trace!(peer = %identity, "reusing connected peer link");
                return Ok(link.clone());
            }
            if mode == DialMode::Reconnect && !links.contains_key(&id) {
                return Err(TransportError::ConnectionClosed.into());
            }

            let mut dialing = lock(&self.dialing);
            if dialing.contains(&id) {
                return Err(MeshError::DialInProgress(id));
            }
            let occupied = links.len() - usize::from(links.contains_key(&id)) + dialing.len();
            if occupied >= self.config.max_peers {
                warn!(peer = %identity, capacity = self.config.max_peers, "peer pool full");
                return Err(MeshError::PoolFull {
                    capacity: self.config.max_peers,
                });
            }
            dialing.insert(id);
            DialReservation {
                dialing: &self.dialing,
                id,
            }
        };

        debug!(peer = %identity, endpoint = %identity.endpoint(), "dialing peer");
        let stream = match self.dialer.dial(&identity).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %identity, error = %e, "failed to connect to peer");
                return Err(e.into());
            }
        };

        let (link, previous) = {
            let mut links = self.links.write().await;
            if self.shutdown.is_cancelled() {
                return Err(MeshError::Shutdown);
            }
            if mode == DialMode::Reconnect && !links.contains_key(&id) {
                debug!(peer = %identity, "peer removed during reconnection");
                return Err(TransportError::ConnectionClosed.into());
            }

            let link = Arc::new(
                PeerLink::builder(identity.clone())
                    .max_frame_size(self.config.max_frame_size)
                    .buffer_size(self.config.buffer_size)
                    .on_state_change(self.notifier.clone())
                    .build(stream),
            );
            if let Some(previous) = links.get(&id) {
                link.metrics().carry_retries(previous.metrics());
            }
            let previous = links.insert(id, link.clone());
            drop(reservation);
            (link, previous)
        };

        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(peer = %identity, error = %e, "error closing replaced link");
            }
        }

        info!(peer = %identity, "peer connected");
        self.notifier.notify(&identity, PeerLinkState::Connected);
        self.spawn_monitor(identity);
        Ok(link)
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.keepalive_interval;

        self.tasks.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.keepalive_round().await;
                    }
                }
            }
            debug!("keepalive task stopped");
        });
    }

    async fn keepalive_round(&self) {
        let links: Vec<_> = self
            .links
            .read()
            .await
            .values()
            .filter(|link| link.is_connected())
            .cloned()
            .collect();
        if links.is_empty() {
            return;
        }
        trace!(peers = links.len(), "sending keepalives");

        let mut probes = JoinSet::new();
        for link in links {
            probes.spawn(async move {
                let result = link.send(FrameType::KeepAlive, &[]).await;
                (link, result)
            });
        }

        // A round lasts at most one write deadline; closes of failed links
        // run outside it.
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((link, Err(e))) => {
                    warn!(peer = %link.identity(), error = %e, "keepalive failed, closing link");
                    self.tasks.spawn(async move {
                        let _ = link.close().await;
                    });
                }
                Ok((_, Ok(()))) => {}
                Err(e) => error!(error = %e, "keepalive probe task failed"),
            }
        }
    }

    fn spawn_monitor(self: &Arc<Self>, identity: PeerIdentity) {
        if self.shutdown.is_cancelled() || !lock(&self.monitors).insert(identity.id) {
            return;
        }
        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(supervise(pool, shutdown, identity));
    }

    async fn monitor_exited(self: &Arc<Self>, id: PeerId) {
        lock(&self.monitors).remove(&id);

        // A fresh dial may have replaced the entry while this monitor was
        // giving up; that link still needs supervision.
        let replacement = self
            .links
            .read()
            .await
            .get(&id)
            .filter(|link| link.is_connected())
            .map(|link| link.identity().clone());
        if let Some(identity) = replacement {
            self.spawn_monitor(identity);
        }
    }
}

impl<D: PeerDialer> Drop for PoolInner<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reconnection monitor for one peer.
///
/// Polls the entry while it is connected. Once the link is closed it
/// redials up to `max_attempts` times with backoff, then forces the entry
/// to DISCONNECTED and exits. Also exits when the entry is removed or the
/// pool shuts down.
async fn supervise<D: PeerDialer>(
    pool: Weak<PoolInner<D>>,
    shutdown: CancellationToken,
    identity: PeerIdentity,
) {
    let id = identity.id;
    let mut attempt: u32 = 0;
    debug!(peer = %identity, "reconnection monitor started");

    loop {
        let Some(inner) = pool.upgrade() else { return };
        let Some(link) = inner.links.read().await.get(&id).cloned() else {
            debug!(peer = %identity, "peer removed, monitor exiting");
            break;
        };

        // The state only leaves CONNECTED once `close` has run.
        let redial = link.state() != PeerLinkState::Connected;
        let wait = if !redial {
            attempt = 0;
            inner.config.monitor_interval
        } else if attempt >= inner.config.reconnect.max_attempts {
            warn!(peer = %identity, attempts = attempt, "reconnection attempts exhausted");
            link.set_state(PeerLinkState::Disconnected);
            break;
        } else {
            link.set_state(PeerLinkState::Reconnecting);
            link.metrics().record_retry();
            let delay = inner.backoff.delay(attempt);
            info!(
                peer = %identity,
                attempt = attempt + 1,
                max_attempts = inner.config.reconnect.max_attempts,
                ?delay,
                "scheduling reconnection"
            );
            delay
        };
        drop(link);
        drop(inner);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(wait) => {}
        }
        if !redial {
            continue;
        }

        let Some(inner) = pool.upgrade() else { return };
        match inner.connect(identity.clone(), DialMode::Reconnect).await {
            Ok(_) => {
                info!(peer = %identity, "peer reconnected");
                attempt = 0;
            }
            Err(e) => {
                attempt += 1;
                warn!(peer = %identity, attempt, error = %e, "reconnection attempt failed");
            }
        }
    }

    if let Some(inner) = pool.upgrade() {
        inner.monitor_exited(id).await;
    }
    debug!(peer = %identity, "reconnection monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ReconnectConfig;
    use crate::transport::{TransportResult, read_frame};
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{DuplexStream, duplex};
    use tokio::time::timeout;

    #[derive(Default)]
    struct TestDialer {
        remotes: Mutex<Vec<(PeerId, DuplexStream)>>,
        dials: AtomicUsize,
        failing: AtomicBool,
        delay: Option<Duration>,
    }

    impl PeerDialer for TestDialer {
        type Stream = DuplexStream;

        async fn dial(&self, peer: &PeerIdentity) -> TransportResult<DuplexStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
            }
            let (local, remote) = duplex(64 * 1024);
            self.remotes.lock().unwrap().push((peer.id, remote));
            Ok(local)
        }
    }

    fn config(max_peers: usize) -> PeerPoolConfig {
        PeerPoolConfig::builder()
            .max_peers(max_peers)
            .keepalive_interval(Duration::from_millis(20))
            .monitor_interval(Duration::from_millis(10))
            .reconnect(ReconnectConfig {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: 3,
                jitter_factor: 0.0,
            })
            .build()
    }

    fn pool(max_peers: usize) -> PeerPool<TestDialer> {
        PeerPool::with_dialer(config(max_peers), TestDialer::default()).unwrap()
    }

    fn peer(port: u16) -> PeerIdentity {
        PeerIdentity::new(PeerId::generate(), "127.0.0.1", port)
    }

    fn dials(pool: &PeerPool<TestDialer>) -> usize {
        pool.inner.dialer.dials.load(Ordering::SeqCst)
    }

    fn drop_remotes(pool: &PeerPool<TestDialer>, id: PeerId) {
        pool.inner
            .dialer
            .remotes
            .lock()
            .unwrap()
            .retain(|(peer, _)| *peer != id);
    }

    fn record_states(pool: &PeerPool<TestDialer>) -> Arc<Mutex<Vec<PeerLinkState>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        pool.notifier()
            .subscribe(move |_: &PeerIdentity, state: PeerLinkState| {
                sink.lock().unwrap().push(state);
            });
        log
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        timeout(Duration::from_secs(5), async {
            while !check().await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_dial_registers_and_reuses() {
        let pool = pool(4);
        let identity = peer(7001);
        let id = identity.id;

        let first = pool.dial_and_register(identity.clone()).await.unwrap();
        let second = pool.dial_and_register(identity).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dials(&pool), 1);

        let found = pool.get(&id).await.unwrap();
        assert_eq!(found.state(), PeerLinkState::Connected);
        assert_eq!(pool.connected_peers().await, vec![id]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_admission_limit() {
        let pool = pool(2);
        let a = peer(7001);
        let b = peer(7002);
        let c = peer(7003);

        pool.dial_and_register(a.clone()).await.unwrap();
        pool.dial_and_register(b.clone()).await.unwrap();

        let err = pool.dial_and_register(c.clone()).await.unwrap_err();
        assert!(err.is_admission_denied());
        assert!(matches!(err, MeshError::PoolFull { capacity: 2 }));
        assert_eq!(dials(&pool), 2);
        assert!(pool.get(&a.id).await.is_some());
        assert!(pool.get(&b.id).await.is_some());

        pool.close(&a.id).await.unwrap();
        pool.dial_and_register(c.clone()).await.unwrap();
        assert_eq!(pool.len().await, 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_no_entry() {
        let pool = pool(1);
        pool.inner.dialer.failing.store(true, Ordering::SeqCst);

        let identity = peer(7001);
        let err = pool.dial_and_register(identity.clone()).await.unwrap_err();
        assert!(matches!(err, MeshError::Transport(_)));
        assert!(!err.is_admission_denied());
        assert!(pool.is_empty().await);

        // The failed dial released its capacity slot.
        pool.inner.dialer.failing.store(false, Ordering::SeqCst);
        pool.dial_and_register(identity).await.unwrap();

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_dial_same_peer() {
        let dialer = TestDialer {
            delay: Some(Duration::from_millis(50)),
            ..TestDialer::default()
        };
        let pool = PeerPool::with_dialer(config(4), dialer).unwrap();
        let identity = peer(7001);

        let (first, second) = tokio::join!(
            pool.dial_and_register(identity.clone()),
            pool.dial_and_register(identity.clone())
        );
        let in_progress = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(MeshError::DialInProgress(_))))
            .count();
        assert_eq!(in_progress, 1);
        assert!(first.is_ok() || second.is_ok());
        assert_eq!(dials(&pool), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_sends_close_frame() {
        let pool = pool(4);
        let identity = peer(7001);
        pool.dial_and_register(identity.clone()).await.unwrap();

        pool.close(&identity.id).await.unwrap();
        assert!(pool.get(&identity.id).await.is_none());
        assert!(pool.is_empty().await);
        pool.close(&identity.id).await.unwrap();

        let (_, mut remote) = pool.inner.dialer.remotes.lock().unwrap().remove(0);
        loop {
            let frame = read_frame(&mut remote, 1024).await.unwrap();
            if frame.frame_type == FrameType::Close {
                break;
            }
            assert_eq!(frame.frame_type, FrameType::KeepAlive);
        }

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_keepalive_reaches_peers() {
        let pool = pool(4);
        let identity = peer(7001);
        pool.dial_and_register(identity).await.unwrap();

        let (_, mut remote) = pool.inner.dialer.remotes.lock().unwrap().remove(0);
        let frame = timeout(Duration::from_secs(2), read_frame(&mut remote, 1024))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.frame_type, FrameType::KeepAlive);
        assert!(frame.payload.is_empty());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_keepalive_failure() {
        let pool = pool(4);
        let states = record_states(&pool);
        let identity = peer(7001);
        let id = identity.id;

        let original = pool.dial_and_register(identity).await.unwrap();
        drop_remotes(&pool, id);

        {
            let pool = &pool;
            let original = &original;
            eventually(move || async move {
                pool.get(&id)
                    .await
                    .is_some_and(|link| !Arc::ptr_eq(&link, original))
            })
            .await;
            let states = &states;
            eventually(move || async move { states.lock().unwrap().len() >= 4 }).await;
        }

        assert!(original.is_closed());
        assert_eq!(dials(&pool), 2);
        let replacement = pool.get(&id).await.unwrap();
        assert_eq!(replacement.metrics().snapshot().retries, 1);
        assert_eq!(
            states.lock().unwrap()[..4],
            [
                PeerLinkState::Connected,
                PeerLinkState::Disconnected,
                PeerLinkState::Reconnecting,
                PeerLinkState::Connected,
            ]
        );

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnection_gives_up_after_max_attempts() {
        let pool = pool(1);
        let states = record_states(&pool);
        let identity = peer(7001);
        let id = identity.id;

        pool.dial_and_register(identity.clone()).await.unwrap();
        pool.inner.dialer.failing.store(true, Ordering::SeqCst);
        drop_remotes(&pool, id);

        {
            let states = &states;
            eventually(move || async move { states.lock().unwrap().len() >= 4 }).await;
        }
        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                PeerLinkState::Connected,
                PeerLinkState::Disconnected,
                PeerLinkState::Reconnecting,
                PeerLinkState::Disconnected,
            ]
        );
        assert_eq!(dials(&pool), 1 + 3);
        assert!(pool.get(&id).await.is_none());

        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_peers, 1);
        assert_eq!(metrics.disconnected, 1);
        assert_eq!(metrics.peers[0].metrics.retries, 3);

        // A fresh dial replaces the tombstone without counting it twice.
        pool.inner.dialer.failing.store(false, Ordering::SeqCst);
        let fresh = pool.dial_and_register(identity).await.unwrap();
        assert!(pool.get(&id).await.is_some());
        assert_eq!(pool.len().await, 1);
        assert_eq!(fresh.metrics().snapshot().retries, 3);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_failure_triggers_reconnect() {
        let pool = pool(4);
        let identity = peer(7001);
        let id = identity.id;

        let original = pool.dial_and_register(identity).await.unwrap();
        pool.report_failure(&id).await;
        assert!(original.is_closed());
        assert_eq!(pool.len().await, 1);

        {
            let pool = &pool;
            eventually(move || async move { pool.get(&id).await.is_some() }).await;
        }
        assert_eq!(dials(&pool), 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let pool = pool(4);
        let a = pool.dial_and_register(peer(7001)).await.unwrap();
        let b = pool.dial_and_register(peer(7002)).await.unwrap();

        pool.shutdown().await;

        assert!(pool.is_shutdown());
        assert!(a.is_closed() && b.is_closed());
        assert!(pool.is_empty().await);
        assert!(matches!(
            pool.dial_and_register(peer(7003)).await,
            Err(MeshError::Shutdown)
        ));
        assert_eq!(pool.inner.tasks.len(), 0);
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let pool = pool(4);
        let busy = pool.dial_and_register(peer(7001)).await.unwrap();
        pool.dial_and_register(peer(7002)).await.unwrap();

        busy.send(FrameType::Data, b"hello").await.unwrap();

        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_peers, 2);
        assert_eq!(metrics.connected, 2);
        assert_eq!(metrics.max_peers, 4);
        assert!((metrics.utilization_pct - 50.0).abs() < f64::EPSILON);

        let report = metrics
            .peers
            .iter()
            .find(|report| report.identity.id == busy.id())
            .unwrap();
        assert!(report.metrics.messages_sent >= 1);
        assert!(report.metrics.bytes_sent >= 11);

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["connected"], 2);
        assert_eq!(json["peers"][0]["state"], "CONNECTED");

        pool.shutdown().await;
    }
}
