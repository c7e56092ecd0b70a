//! # Sync Server
//!
//! Accepts client connections and streams the snapshot cache to each of them.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Sync Server                                    │
//! │                                                                         │
//! │   accept task ──────┬──────────────┬──────────────┐                     │
//! │   (JoinSet owner)   │              │              │                     │
//! │                     ▼              ▼              ▼                     │
//! │               ┌──────────┐   ┌──────────┐   ┌──────────┐  drop task     │
//! │               │ conn #1  │   │ conn #2  │   │ conn #3  │  (admission)   │
//! │               │ writer ◀─┼───┼─ breadcrumb chain ──────┼──── cache      │
//! │               │ reader   │   │ writer   │   │ writer   │                │
//! │               └──────────┘   └──────────┘   └──────────┘                │
//! │                                                                         │
//! │   registry: id → {peer, hostname, last pong, cancel token, dropped}    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection Lifecycle
//! ```text
//! Accepted ──hello──▶ HelloExchanged ──snapshot──▶ Streaming
//!    │                     │                           │
//!    └─────────────────────┴───────────────────────────┴──▶ Closing | Dropped | Failed
//! ```
//!
//! Every exit path runs the connection's `ConnectionGuard`, which removes the
//! registry entry and decrements `strata_connections_active` exactly once.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use strata_core::SerializedUpdate;
use tokio::io::AsyncWrite;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{Finished, FinishedGuard};
use crate::metrics::ServerMetrics;
use crate::protocol::{
    Envelope, EnvelopeReader, EnvelopeWriter, KvsPhase, DEFAULT_MAX_FRAME_SIZE,
};
use crate::snapcache::{Breadcrumb, SnapshotCache};

/// Version reported in the server hello.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const UNLIMITED: usize = usize::MAX;

// =============================================================================
// Configuration
// =============================================================================

/// Runtime settings of a [`SyncServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// 0 picks a random free port.
    pub port: u16,
    /// `None` means unlimited.
    pub max_conns: Option<usize>,
    pub drop_interval: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub hello_timeout: Duration,
    pub write_timeout: Duration,
    pub max_kvs_per_message: usize,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5473,
            max_conns: None,
            drop_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(60),
            hello_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(120),
            max_kvs_per_message: 100,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = Some(max_conns);
        self
    }

    pub fn with_drop_interval(mut self, drop_interval: Duration) -> Self {
        self.drop_interval = drop_interval;
        self
    }

    pub fn with_heartbeat(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    pub fn with_hello_timeout(mut self, hello_timeout: Duration) -> Self {
        self.hello_timeout = hello_timeout;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_max_kvs_per_message(mut self, max_kvs_per_message: usize) -> Self {
        self.max_kvs_per_message = max_kvs_per_message;
        self
    }
}

// =============================================================================
// Connection Bookkeeping
// =============================================================================

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    /// Closed by admission control.
    Dropped,
    ServerShutdown,
    HeartbeatTimeout,
    HelloTimeout,
    Protocol,
    Io,
}

impl DisconnectReason {
    /// Returns true for teardowns counted in `strata_connections_failed`.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DisconnectReason::HeartbeatTimeout
                | DisconnectReason::HelloTimeout
                | DisconnectReason::Protocol
                | DisconnectReason::Io
        )
    }

    fn from_error(err: &SyncError) -> Self {
        match err {
            SyncError::Disconnected => DisconnectReason::ClientClosed,
            SyncError::HeartbeatTimeout { .. } => DisconnectReason::HeartbeatTimeout,
            SyncError::Timeout { operation: "hello", .. } => DisconnectReason::HelloTimeout,
            e if e.is_protocol_error() => DisconnectReason::Protocol,
            _ => DisconnectReason::Io,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientClosed => write!(f, "client_closed"),
            DisconnectReason::Dropped => write!(f, "dropped"),
            DisconnectReason::ServerShutdown => write!(f, "server_shutdown"),
            DisconnectReason::HeartbeatTimeout => write!(f, "heartbeat_timeout"),
            DisconnectReason::HelloTimeout => write!(f, "hello_timeout"),
            DisconnectReason::Protocol => write!(f, "protocol"),
            DisconnectReason::Io => write!(f, "io"),
        }
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Accept order; lower is older.
    pub id: u64,
    pub peer: SocketAddr,
    /// Set once the hello has been received.
    pub hostname: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_pong: Option<DateTime<Utc>>,
}

struct ConnectionEntry {
    info: ConnectionInfo,
    cancel: CancellationToken,
    dropped: bool,
}

struct ServerShared {
    config: ServerConfig,
    cache: Arc<SnapshotCache>,
    /// `UNLIMITED` when no limit is set.
    max_conns: AtomicUsize,
    next_id: AtomicU64,
    /// Ordered by id, so iteration visits the oldest connection first.
    registry: Mutex<BTreeMap<u64, ConnectionEntry>>,
    metrics: ServerMetrics,
}

impl ServerShared {
    fn register(self: &Arc<Self>, peer: SocketAddr, cancel: CancellationToken) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().insert(
            id,
            ConnectionEntry {
                info: ConnectionInfo {
                    id,
                    peer,
                    hostname: None,
                    connected_at: Utc::now(),
                    last_pong: None,
                },
                cancel,
                dropped: false,
            },
        );
        self.metrics.connections_active.inc();
        self.metrics.connections_accepted.inc();

        ConnectionGuard {
            shared: Arc::clone(self),
            id,
        }
    }

    fn set_hostname(&self, id: u64, hostname: &str) {
        if let Some(entry) = self.registry.lock().get_mut(&id) {
            entry.info.hostname = Some(hostname.to_string());
        }
    }

    fn record_pong(&self, id: u64, at: DateTime<Utc>) {
        if let Some(entry) = self.registry.lock().get_mut(&id) {
            entry.info.last_pong = Some(at);
        }
    }

    fn was_dropped(&self, id: u64) -> bool {
        self.registry
            .lock()
            .get(&id)
            .map(|entry| entry.dropped)
            .unwrap_or(false)
    }

    /// Closes the oldest connection if the server is above its limit.
    fn drop_one_excess(&self) {
        let max = self.max_conns.load(Ordering::Relaxed);
        if max == UNLIMITED {
            return;
        }

        let mut registry = self.registry.lock();
        let live = registry.values().filter(|entry| !entry.dropped).count();
        if live <= max {
            return;
        }

        if let Some(entry) = registry.values_mut().find(|entry| !entry.dropped) {
            entry.dropped = true;
            entry.cancel.cancel();
            self.metrics.connections_dropped.inc();
            info!(
                conn_id = entry.info.id,
                peer = %entry.info.peer,
                live,
                max_conns = max,
                "Dropping connection to enforce max_conns"
            );
        }
    }
}

/// Removes the registry entry and decrements the active gauge on drop.
struct ConnectionGuard {
    shared: Arc<ServerShared>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shared.registry.lock().remove(&self.id);
        self.shared.metrics.connections_active.dec();
    }
}

// =============================================================================
// Server
// =============================================================================

/// TCP server fanning the snapshot cache out to clients.
pub struct SyncServer {
    config: ServerConfig,
    cache: Arc<SnapshotCache>,
}

/// Handle to a running [`SyncServer`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    finished: Finished,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sets the connection limit; excess connections are closed by the drop
    /// task, one per tick.
    pub fn set_max_conns(&self, max_conns: usize) {
        info!(max_conns, "Updating connection limit");
        self.shared.max_conns.store(max_conns, Ordering::Relaxed);
    }

    pub fn clear_max_conns(&self) {
        info!("Removing connection limit");
        self.shared.max_conns.store(UNLIMITED, Ordering::Relaxed);
    }

    pub fn max_conns(&self) -> Option<usize> {
        match self.shared.max_conns.load(Ordering::Relaxed) {
            UNLIMITED => None,
            max => Some(max),
        }
    }

    /// Current value of the active-connections gauge.
    pub fn connections_active(&self) -> i64 {
        self.shared.metrics.connections_active.get()
    }

    /// Snapshot of every registered connection, oldest first.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .registry
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.shared.metrics
    }

    /// Resolves once the accept loop and every connection task have exited.
    pub fn finished(&self) -> Finished {
        self.finished.clone()
    }
}

impl SyncServer {
    pub fn new(config: ServerConfig, cache: Arc<SnapshotCache>) -> Self {
        Self { config, cache }
    }

    /// Binds the listener and spawns the accept and drop tasks.
    ///
    /// Cancelling `cancel` stops accepting and closes every connection.
    pub async fn start(self, cancel: CancellationToken) -> SyncResult<ServerHandle> {
        let bind_addr = format!("{}:{}", self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: bind_addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            max_conns: AtomicUsize::new(self.config.max_conns.unwrap_or(UNLIMITED)),
            config: self.config,
            cache: self.cache,
            next_id: AtomicU64::new(1),
            registry: Mutex::new(BTreeMap::new()),
            metrics: ServerMetrics::default(),
        });

        let (finished, guard) = Finished::new();
        tokio::spawn(accept_loop(Arc::clone(&shared), listener, cancel, guard));

        info!(addr = %local_addr, "Sync server started");

        Ok(ServerHandle {
            shared,
            local_addr,
            finished,
        })
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    cancel: CancellationToken,
    _finished: FinishedGuard,
) {
    let mut tasks = JoinSet::new();
    tasks.spawn(drop_loop(Arc::clone(&shared), cancel.clone()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Sync server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_cancel = cancel.child_token();
                    let guard = shared.register(peer, conn_cancel.clone());
                    debug!(conn_id = guard.id, peer = %peer, "Accepted connection");
                    tasks.spawn(handle_connection(Arc::clone(&shared), stream, peer, conn_cancel, guard));
                }
                Err(e) => {
                    warn!(?e, "Accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
            },
            // Reap finished connection tasks.
            Some(_) = tasks.join_next() => {}
        }
    }

    drop(listener);
    while tasks.join_next().await.is_some() {}
    debug!("All connection tasks exited");
}

/// Admission control: closes at most one excess connection per tick.
async fn drop_loop(shared: Arc<ServerShared>, cancel: CancellationToken) {
    loop {
        let delay = jittered(shared.config.drop_interval);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => shared.drop_one_excess(),
        }
    }
}

/// `base` plus or minus uniform jitter of up to `base / 10`.
fn jittered(base: Duration) -> Duration {
    let max_jitter = (base / 10).as_millis() as i64;
    let jitter = rand::thread_rng().gen_range(-max_jitter..=max_jitter);
    if jitter >= 0 {
        base + Duration::from_millis(jitter as u64)
    } else {
        base.saturating_sub(Duration::from_millis(jitter.unsigned_abs()))
    }
}

// =============================================================================
// Per-Connection Handling
// =============================================================================

async fn handle_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
    guard: ConnectionGuard,
) {
    let id = guard.id;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id = id, ?e, "Failed to set TCP_NODELAY");
    }

    let result = serve_connection(&shared, id, stream, &cancel).await;
    let reason = match &result {
        Ok(()) if shared.was_dropped(id) => DisconnectReason::Dropped,
        Ok(()) => DisconnectReason::ServerShutdown,
        Err(e) => DisconnectReason::from_error(e),
    };

    if reason.is_failure() {
        shared.metrics.connections_failed.inc();
    }

    match (&result, reason) {
        (Err(e), r) if r.is_failure() => {
            warn!(conn_id = id, peer = %peer, reason = %r, error = %e, "Connection failed")
        }
        (_, DisconnectReason::ServerShutdown) => {
            debug!(conn_id = id, peer = %peer, reason = %reason, "Connection closed")
        }
        _ => info!(conn_id = id, peer = %peer, reason = %reason, "Connection closed"),
    }

    drop(guard);
}

async fn serve_connection(
    shared: &Arc<ServerShared>,
    id: u64,
    stream: TcpStream,
    cancel: &CancellationToken,
) -> SyncResult<()> {
    let config = &shared.config;
    let (read_half, write_half) = stream.into_split();
    let mut reader = EnvelopeReader::new(read_half, config.max_frame_size);
    let mut writer = EnvelopeWriter::new(write_half);

    // Hello exchange
    let first = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        read = timeout(config.hello_timeout, reader.read()) => read.map_err(|_| SyncError::Timeout {
            operation: "hello",
            after_ms: config.hello_timeout.as_millis() as u64,
        })??,
    };
    let hello = match first {
        Envelope::ClientHello(hello) => hello,
        other => {
            return Err(SyncError::UnexpectedMessageType {
                expected: "client_hello",
                actual: other.type_name(),
            })
        }
    };

    info!(
        conn_id = id,
        hostname = %hello.hostname,
        version = %hello.version,
        info = %hello.info,
        "Client hello received"
    );
    shared.set_hostname(id, &hello.hostname);
    let hello_reply = Envelope::server_hello(SERVER_VERSION);
    if !write_bounded(&mut writer, &hello_reply, config.write_timeout, cancel).await? {
        return Ok(());
    }

    // The pong deadline starts at the hello.
    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let mut read_task = JoinSet::new();
    read_task.spawn(read_loop(
        reader,
        Arc::clone(shared),
        id,
        Arc::clone(&last_pong),
    ));

    let result = stream_updates(shared, id, &mut writer, cancel, &mut read_task, &last_pong).await;

    read_task.shutdown().await;
    result
}

/// Reads pongs until the client sends anything else or the socket fails.
async fn read_loop(
    mut reader: EnvelopeReader<OwnedReadHalf>,
    shared: Arc<ServerShared>,
    id: u64,
    last_pong: Arc<Mutex<Instant>>,
) -> SyncResult<()> {
    loop {
        match reader.read().await? {
            Envelope::Pong(pong) => {
                *last_pong.lock() = Instant::now();
                shared.record_pong(id, pong.pong_timestamp);
                debug!(conn_id = id, ping = %pong.ping_timestamp, "Pong received");
            }
            other => {
                return Err(SyncError::UnexpectedMessageType {
                    expected: "pong",
                    actual: other.type_name(),
                })
            }
        }
    }
}

/// Sends the snapshot, then follows the breadcrumb chain until cancelled.
async fn stream_updates(
    shared: &ServerShared,
    id: u64,
    writer: &mut EnvelopeWriter<OwnedWriteHalf>,
    cancel: &CancellationToken,
    read_task: &mut JoinSet<SyncResult<()>>,
    last_pong: &Mutex<Instant>,
) -> SyncResult<()> {
    let config = &shared.config;

    let mut crumb = shared.cache.current_breadcrumb();
    if !send_snapshot(writer, &crumb, config, cancel).await? {
        return Ok(());
    }
    if !write_bounded(writer, &Envelope::status(crumb.status), config.write_timeout, cancel).await? {
        return Ok(());
    }
    let mut last_status = crumb.status;
    debug!(conn_id = id, seq = crumb.seq, kvs = crumb.kvs.len(), "Snapshot sent");

    let start = tokio::time::Instant::now() + config.ping_interval;
    let mut ping = interval_at(start, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let current = Arc::clone(&crumb);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            Some(joined) = read_task.join_next() => {
                return match joined {
                    Ok(Ok(())) => Err(SyncError::Disconnected),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(SyncError::Internal(format!("read task failed: {e}"))),
                };
            }

            _ = ping.tick() => {
                let elapsed = last_pong.lock().elapsed();
                if elapsed > config.pong_timeout {
                    return Err(SyncError::HeartbeatTimeout {
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                }
                if !write_bounded(writer, &Envelope::ping(), config.write_timeout, cancel).await? {
                    return Ok(());
                }
            }

            next = current.next(cancel) => {
                let Some(next) = next else {
                    return Ok(());
                };
                crumb = next;

                if !crumb.updates.is_empty() {
                    for chunk in crumb.updates.chunks(config.max_kvs_per_message) {
                        let envelope = Envelope::kvs(chunk.to_vec(), KvsPhase::Incremental);
                        if !write_bounded(writer, &envelope, config.write_timeout, cancel).await? {
                            return Ok(());
                        }
                    }
                }
                if crumb.status != last_status {
                    let envelope = Envelope::status(crumb.status);
                    if !write_bounded(writer, &envelope, config.write_timeout, cancel).await? {
                        return Ok(());
                    }
                    last_status = crumb.status;
                }
            }
        }
    }
}

/// Sends `crumb.kvs` as `Snapshot` chunks ending with one `SnapshotEnd`.
///
/// Returns `false` if cancelled before the last chunk went out.
async fn send_snapshot(
    writer: &mut EnvelopeWriter<OwnedWriteHalf>,
    crumb: &Breadcrumb,
    config: &ServerConfig,
    cancel: &CancellationToken,
) -> SyncResult<bool> {
    let mut values = crumb.kvs.values().peekable();
    loop {
        let chunk: Vec<SerializedUpdate> = values
            .by_ref()
            .take(config.max_kvs_per_message)
            .cloned()
            .collect();
        let phase = if values.peek().is_some() {
            KvsPhase::Snapshot
        } else {
            KvsPhase::SnapshotEnd
        };

        if !write_bounded(writer, &Envelope::kvs(chunk, phase), config.write_timeout, cancel).await? {
            return Ok(false);
        }
        if phase == KvsPhase::SnapshotEnd {
            return Ok(true);
        }
    }
}

/// Writes one envelope, giving up after `limit` or as soon as `cancel` fires.
///
/// Returns `false` if cancelled. A peer that stops reading must not hold a
/// drop or a shutdown for the whole write timeout.
async fn write_bounded<W>(
    writer: &mut EnvelopeWriter<W>,
    envelope: &Envelope,
    limit: Duration,
    cancel: &CancellationToken,
) -> SyncResult<bool>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Ok(false),
        written = timeout(limit, writer.write(envelope)) => {
            written.map_err(|_| SyncError::Timeout {
                operation: "write",
                after_ms: limit.as_millis() as u64,
            })??;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapcache::CacheConfig;
    use strata_core::{ResourceKey, SyncStatus, SyncerCallbacks, Update};

    fn test_server_config() -> ServerConfig {
        ServerConfig::default()
            .with_bind_addr("127.0.0.1")
            .with_port(0)
            .with_max_kvs_per_message(2)
    }

    async fn connect(handle: &ServerHandle) -> (EnvelopeReader<OwnedReadHalf>, EnvelopeWriter<OwnedWriteHalf>) {
        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        (
            EnvelopeReader::new(read_half, DEFAULT_MAX_FRAME_SIZE),
            EnvelopeWriter::new(write_half),
        )
    }

    async fn wait_for_gauge(handle: &ServerHandle, expected: i64) {
        for _ in 0..200 {
            if handle.connections_active() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.connections_active(), expected);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(50);
        let mut below = false;
        let mut above = false;
        for _ in 0..500 {
            let delay = jittered(base);
            assert!(delay >= base - Duration::from_millis(5));
            assert!(delay <= base + Duration::from_millis(5));
            below |= delay < base;
            above |= delay > base;
        }
        assert!(below && above);

        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_disconnect_reason_classification() {
        assert_eq!(
            DisconnectReason::from_error(&SyncError::Disconnected),
            DisconnectReason::ClientClosed
        );
        assert_eq!(
            DisconnectReason::from_error(&SyncError::Timeout {
                operation: "hello",
                after_ms: 10
            }),
            DisconnectReason::HelloTimeout
        );
        assert_eq!(
            DisconnectReason::from_error(&SyncError::InvalidMessage("empty frame".into())),
            DisconnectReason::Protocol
        );
        assert!(!DisconnectReason::Dropped.is_failure());
        assert!(DisconnectReason::HeartbeatTimeout.is_failure());
    }

    #[tokio::test]
    async fn test_snapshot_is_chunked() {
        let cache = Arc::new(SnapshotCache::new(CacheConfig::default()));
        cache.on_updates(
            (0..5)
                .map(|i| Update::new(ResourceKey::global_config(format!("k{i}")), "v".into(), "1"))
                .collect(),
        );
        cache.on_status_updated(SyncStatus::InSync);

        let cancel = CancellationToken::new();
        let handle = SyncServer::new(test_server_config(), cache)
            .start(cancel.clone())
            .await
            .unwrap();

        let (mut reader, mut writer) = connect(&handle).await;
        writer.write(&Envelope::client_hello("test-host", "v0", "unit test")).await.unwrap();

        assert!(matches!(reader.read().await.unwrap(), Envelope::ServerHello(_)));

        let mut phases = Vec::new();
        let mut total = 0;
        loop {
            match reader.read().await.unwrap() {
                Envelope::Kvs(msg) => {
                    total += msg.kvs.len();
                    phases.push(msg.phase);
                    if msg.phase == KvsPhase::SnapshotEnd {
                        break;
                    }
                }
                other => panic!("unexpected {}", other.type_name()),
            }
        }
        assert_eq!(total, 5);
        assert_eq!(
            phases,
            vec![KvsPhase::Snapshot, KvsPhase::Snapshot, KvsPhase::SnapshotEnd]
        );
        match reader.read().await.unwrap() {
            Envelope::StatusUpdate(msg) => assert_eq!(msg.status, SyncStatus::InSync),
            other => panic!("unexpected {}", other.type_name()),
        }

        let connections = handle.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].hostname.as_deref(), Some("test-host"));

        cancel.cancel();
        handle.finished().wait().await;
        assert_eq!(handle.connections_active(), 0);
    }

    #[tokio::test]
    async fn test_non_hello_first_message_fails() {
        let cache = Arc::new(SnapshotCache::new(CacheConfig::default()));
        let cancel = CancellationToken::new();
        let handle = SyncServer::new(test_server_config(), cache)
            .start(cancel.clone())
            .await
            .unwrap();

        let (mut reader, mut writer) = connect(&handle).await;
        wait_for_gauge(&handle, 1).await;
        writer.write(&Envelope::ping()).await.unwrap();

        assert!(reader.read().await.is_err());
        wait_for_gauge(&handle, 0).await;
        assert_eq!(handle.metrics().connections_failed.get(), 1);

        cancel.cancel();
        handle.finished().wait().await;
    }

    #[tokio::test]
    async fn test_hello_timeout() {
        let cache = Arc::new(SnapshotCache::new(CacheConfig::default()));
        let cancel = CancellationToken::new();
        let config = test_server_config().with_hello_timeout(Duration::from_millis(100));
        let handle = SyncServer::new(config, cache).start(cancel.clone()).await.unwrap();

        let (_reader, _writer) = connect(&handle).await;
        wait_for_gauge(&handle, 1).await;
        wait_for_gauge(&handle, 0).await;
        assert_eq!(handle.metrics().connections_failed.get(), 1);

        cancel.cancel();
        handle.finished().wait().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_config_error() {
        let cache = Arc::new(SnapshotCache::new(CacheConfig::default()));
        let cancel = CancellationToken::new();
        let first = SyncServer::new(test_server_config(), cache.clone())
            .start(cancel.clone())
            .await
            .unwrap();

        let err = SyncServer::new(test_server_config().with_port(first.port()), cache)
            .start(cancel.clone())
            .await
            .err()
            .unwrap();
        assert!(err.is_config_error());

        cancel.cancel();
        first.finished().wait().await;
    }
}
