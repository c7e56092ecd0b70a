//! # Sync Client
//!
//! Connects to a sync server, mirrors its snapshot and replays the stream
//! into a local `SyncerCallbacks` sink, reconnecting with backoff.
//!
//! ## Session State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Disconnected ──▶ Connecting ──▶ HelloSent ──▶ Syncing ──▶ InSync      │
//! │                       ▲                          │           │          │
//! │                       │      failure / EOF       ▼           ▼          │
//! │                       └──────────────────── Backoff ◀────────┘          │
//! │                                                                         │
//! │  Backoff: 500ms, 1s, 2s, ... capped at 30s; reset by a full snapshot.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resync
//! The session keeps a mirror of what it delivered. When a new snapshot
//! completes, keys missing from it are delivered as deletions and only the
//! entries that differ are delivered as updates, in one `on_updates` call.
//! A sink that had seen `InSync` is told `ResyncInProgress` first.

use std::collections::BTreeMap;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use strata_core::{SerializedUpdate, SyncStatus, SyncerCallbacks, Update, UpdateType};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{Finished, FinishedGuard};
use crate::protocol::{Envelope, EnvelopeReader, EnvelopeWriter, KvsPhase, DEFAULT_MAX_FRAME_SIZE};

/// Version reported in the client hello.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Connection State
// =============================================================================

/// Session state, observable through [`ClientHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Hello sent, waiting for the server hello.
    HelloSent,
    /// Receiving the snapshot, or streaming while the datastore resyncs.
    Syncing,
    /// Streaming and the server reported `InSync`.
    InSync,
    /// Waiting before the next connection attempt.
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::HelloSent => write!(f, "hello_sent"),
            ConnectionState::Syncing => write!(f, "syncing"),
            ConnectionState::InSync => write!(f, "in_sync"),
            ConnectionState::Backoff => write!(f, "backoff"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Runtime settings of a [`SyncClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server_addr: String,
    pub hostname: String,
    pub info: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed connections before giving up; 0 retries forever.
    pub max_retries: u32,
    /// When false the session finishes after its first connection ends.
    pub reconnect: bool,
    pub max_frame_size: usize,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            hostname: format!("strata-client-{}", Uuid::new_v4()),
            info: "strata-client".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_retries: 0,
            reconnect: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}

// =============================================================================
// Client Handle
// =============================================================================

/// Observes a running [`SyncClient`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    state: watch::Receiver<ConnectionState>,
    finished: Finished,
}

impl ClientHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the session task has exited.
    pub fn finished(&self) -> Finished {
        self.finished.clone()
    }
}

// =============================================================================
// Sync Client
// =============================================================================

/// A reconnecting session feeding a `SyncerCallbacks` sink.
pub struct SyncClient<S> {
    config: ClientConfig,
    sink: S,
}

impl<S> SyncClient<S>
where
    S: SyncerCallbacks + 'static,
{
    pub fn new(config: ClientConfig, sink: S) -> Self {
        Self { config, sink }
    }

    /// Spawns the session task.
    pub fn start(self, cancel: CancellationToken) -> ClientHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (finished, guard) = Finished::new();

        let session = Session {
            backoff: create_backoff(&self.config),
            config: self.config,
            sink: self.sink,
            state: state_tx,
            mirror: BTreeMap::new(),
            sink_status: None,
            failures: 0,
        };
        tokio::spawn(session.run(cancel, guard));

        ClientHandle {
            state: state_rx,
            finished,
        }
    }
}

fn create_backoff(config: &ClientConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: config.initial_backoff,
        max_interval: config.max_backoff,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

struct Session<S> {
    config: ClientConfig,
    sink: S,
    state: watch::Sender<ConnectionState>,
    /// What the sink has been given, keyed by path.
    mirror: BTreeMap<String, SerializedUpdate>,
    /// Last status delivered to the sink.
    sink_status: Option<SyncStatus>,
    backoff: ExponentialBackoff,
    /// Consecutive connections that ended before a full snapshot.
    failures: u32,
}

impl<S: SyncerCallbacks> Session<S> {
    async fn run(mut self, cancel: CancellationToken, _finished: FinishedGuard) {
        info!(server = %self.config.server_addr, hostname = %self.config.hostname, "Sync client starting");

        loop {
            self.set_state(ConnectionState::Connecting);

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_connection() => result,
            };

            match result {
                Ok(()) => info!("Server closed the connection"),
                Err(SyncError::Disconnected) => info!("Server closed the connection"),
                Err(e) => warn!(error = %e, "Connection ended"),
            }

            if !self.config.reconnect {
                debug!("Reconnect disabled, finishing");
                break;
            }

            self.set_state(ConnectionState::Backoff);

            if self.config.max_retries > 0 {
                self.failures += 1;
                if self.failures >= self.config.max_retries {
                    error!(max_retries = self.config.max_retries, "Max reconnection attempts reached");
                    break;
                }
            }

            let Some(delay) = self.backoff.next_backoff() else {
                error!("Backoff exhausted");
                break;
            };
            debug!(?delay, failures = self.failures, "Waiting before reconnect");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Sync client stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run_connection(&mut self) -> SyncResult<()> {
        let addr = self.config.server_addr.clone();
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SyncError::Timeout {
                operation: "connect",
                after_ms: self.config.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| SyncError::ConnectionFailed(format!("{addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(?e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = EnvelopeReader::new(read_half, self.config.max_frame_size);
        let mut writer = EnvelopeWriter::new(write_half);

        let hello = Envelope::client_hello(&self.config.hostname, CLIENT_VERSION, &self.config.info);
        self.write(&mut writer, &hello).await?;
        self.set_state(ConnectionState::HelloSent);

        match self.read(&mut reader).await? {
            Envelope::ServerHello(server) => {
                info!(
                    server = %addr,
                    version = %server.version,
                    protocol_version = server.protocol_version,
                    "Connected to sync server"
                );
            }
            other => {
                return Err(SyncError::UnexpectedMessageType {
                    expected: "server_hello",
                    actual: other.type_name(),
                })
            }
        }
        self.set_state(ConnectionState::Syncing);

        if self.sink_status == Some(SyncStatus::InSync) {
            self.deliver_status(SyncStatus::ResyncInProgress);
        }

        let mut snapshot: Option<Vec<SerializedUpdate>> = Some(Vec::new());
        loop {
            match self.read(&mut reader).await? {
                Envelope::Ping(ping) => {
                    debug!("Ping received");
                    self.write(&mut writer, &Envelope::pong(&ping)).await?;
                }
                Envelope::Kvs(msg) => match (msg.phase, snapshot.as_mut()) {
                    (KvsPhase::Snapshot, Some(buffer)) => buffer.extend(msg.kvs),
                    (KvsPhase::SnapshotEnd, Some(buffer)) => {
                        buffer.extend(msg.kvs);
                        let entries = std::mem::take(buffer);
                        snapshot = None;
                        self.apply_snapshot(entries)?;
                        self.backoff.reset();
                        self.failures = 0;
                    }
                    (KvsPhase::Incremental, None) => self.apply_incremental(msg.kvs)?,
                    (phase, _) => {
                        return Err(SyncError::InvalidMessage(format!(
                            "kvs phase {phase:?} out of order"
                        )))
                    }
                },
                Envelope::StatusUpdate(msg) => {
                    self.deliver_status(msg.status);
                    if snapshot.is_none() {
                        self.set_state(match msg.status {
                            SyncStatus::InSync => ConnectionState::InSync,
                            _ => ConnectionState::Syncing,
                        });
                    }
                }
                other => {
                    return Err(SyncError::UnexpectedMessageType {
                        expected: "kvs, status_update or ping",
                        actual: other.type_name(),
                    })
                }
            }
        }
    }

    async fn read(&self, reader: &mut EnvelopeReader<OwnedReadHalf>) -> SyncResult<Envelope> {
        timeout(self.config.read_timeout, reader.read())
            .await
            .map_err(|_| SyncError::Timeout {
                operation: "read",
                after_ms: self.config.read_timeout.as_millis() as u64,
            })?
    }

    async fn write(
        &self,
        writer: &mut EnvelopeWriter<OwnedWriteHalf>,
        envelope: &Envelope,
    ) -> SyncResult<()> {
        timeout(self.config.write_timeout, writer.write(envelope))
            .await
            .map_err(|_| SyncError::Timeout {
                operation: "write",
                after_ms: self.config.write_timeout.as_millis() as u64,
            })?
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Diffs a complete snapshot against the mirror and delivers the result.
    fn apply_snapshot(&mut self, entries: Vec<SerializedUpdate>) -> SyncResult<()> {
        let fresh: BTreeMap<String, SerializedUpdate> = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();

        // Decode everything before touching the mirror.
        let mut updates = Vec::new();
        for (key, old) in &self.mirror {
            if !fresh.contains_key(key) {
                let removal = SerializedUpdate {
                    value: None,
                    update_type: UpdateType::Deleted,
                    ..old.clone()
                };
                updates.push(removal.to_update()?);
            }
        }
        for (key, entry) in &fresh {
            if self.mirror.get(key) != Some(entry) {
                updates.push(entry.to_update()?);
            }
        }

        debug!(kvs = fresh.len(), changes = updates.len(), "Snapshot complete");
        self.mirror = fresh;
        if !updates.is_empty() {
            self.sink.on_updates(updates);
        }
        Ok(())
    }

    fn apply_incremental(&mut self, entries: Vec<SerializedUpdate>) -> SyncResult<()> {
        let updates = entries
            .iter()
            .map(SerializedUpdate::to_update)
            .collect::<Result<Vec<Update>, _>>()?;

        for entry in entries {
            if entry.is_deletion() {
                self.mirror.remove(&entry.key);
            } else {
                self.mirror.insert(entry.key.clone(), entry);
            }
        }

        if !updates.is_empty() {
            self.sink.on_updates(updates);
        }
        Ok(())
    }

    fn deliver_status(&mut self, status: SyncStatus) {
        if self.sink_status != Some(status) {
            debug!(%status, "Delivering status");
            self.sink.on_status_updated(status);
            self.sink_status = Some(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_core::{ResourceKey, StateRecorder};
    use tokio::net::TcpListener;

    fn entry(name: &str, value: &str, revision: &str) -> SerializedUpdate {
        SerializedUpdate::from_update(&Update::new(
            ResourceKey::global_config(name),
            value.into(),
            revision,
        ))
        .unwrap()
    }

    async fn accept_with_hello(
        listener: &TcpListener,
    ) -> (EnvelopeReader<OwnedReadHalf>, EnvelopeWriter<OwnedWriteHalf>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = EnvelopeReader::new(read_half, DEFAULT_MAX_FRAME_SIZE);
        let mut writer = EnvelopeWriter::new(write_half);

        match reader.read().await.unwrap() {
            Envelope::ClientHello(hello) => assert_eq!(hello.hostname, "test-client"),
            other => panic!("unexpected {}", other.type_name()),
        }
        writer.write(&Envelope::server_hello("test")).await.unwrap();
        (reader, writer)
    }

    async fn wait_for_state(handle: &ClientHandle, expected: ConnectionState) {
        let mut rx = handle.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == expected))
            .await
            .unwrap()
            .unwrap();
    }

    fn test_config(listener: &TcpListener) -> ClientConfig {
        ClientConfig::new(listener.local_addr().unwrap().to_string())
            .with_hostname("test-client")
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::InSync.to_string(), "in_sync");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[tokio::test]
    async fn test_snapshot_incremental_and_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let recorder = Arc::new(StateRecorder::new());
        let cancel = CancellationToken::new();
        let handle = SyncClient::new(test_config(&listener), recorder.clone()).start(cancel.clone());

        let (mut reader, mut writer) = accept_with_hello(&listener).await;
        writer
            .write(&Envelope::kvs(vec![entry("a", "1", "1")], KvsPhase::SnapshotEnd))
            .await
            .unwrap();
        writer.write(&Envelope::status(SyncStatus::InSync)).await.unwrap();
        writer
            .write(&Envelope::kvs(vec![entry("b", "2", "2")], KvsPhase::Incremental))
            .await
            .unwrap();

        let ping = Envelope::ping();
        writer.write(&ping).await.unwrap();
        match (reader.read().await.unwrap(), ping) {
            (Envelope::Pong(pong), Envelope::Ping(ping)) => {
                assert_eq!(pong.ping_timestamp, ping.timestamp)
            }
            (other, _) => panic!("unexpected {}", other.type_name()),
        }

        wait_for_state(&handle, ConnectionState::InSync).await;
        assert_eq!(recorder.len(), 2);
        assert_eq!(recorder.status(), Some(SyncStatus::InSync));

        cancel.cancel();
        handle.finished().wait().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_resync_delivers_diff_and_status_blip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let recorder = Arc::new(StateRecorder::with_history());
        let cancel = CancellationToken::new();
        let handle = SyncClient::new(test_config(&listener), recorder.clone()).start(cancel.clone());

        {
            let (_reader, mut writer) = accept_with_hello(&listener).await;
            writer
                .write(&Envelope::kvs(
                    vec![entry("a", "1", "1"), entry("b", "1", "2")],
                    KvsPhase::SnapshotEnd,
                ))
                .await
                .unwrap();
            writer.write(&Envelope::status(SyncStatus::InSync)).await.unwrap();
            wait_for_state(&handle, ConnectionState::InSync).await;
        }

        let (_reader, mut writer) = accept_with_hello(&listener).await;
        writer
            .write(&Envelope::kvs(vec![entry("b", "1", "2")], KvsPhase::Snapshot))
            .await
            .unwrap();
        writer
            .write(&Envelope::kvs(vec![entry("c", "3", "3")], KvsPhase::SnapshotEnd))
            .await
            .unwrap();
        writer.write(&Envelope::status(SyncStatus::InSync)).await.unwrap();

        wait_for_state(&handle, ConnectionState::InSync).await;

        let batches = recorder.batches();
        assert_eq!(batches.len(), 2);
        let resync = &batches[1];
        assert_eq!(resync.len(), 2);
        assert!(resync[0].is_deletion());
        assert_eq!(resync[0].kv.key, ResourceKey::global_config("a"));
        assert_eq!(resync[1].kv.key, ResourceKey::global_config("c"));

        // InSync, ResyncInProgress, InSync
        assert_eq!(recorder.status_changes(), 3);
        assert!(recorder.get("/calico/v1/config/a").is_none());

        cancel.cancel();
        handle.finished().wait().await;
    }

    #[tokio::test]
    async fn test_undecodable_update_forces_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let recorder = Arc::new(StateRecorder::new());
        let cancel = CancellationToken::new();
        let handle = SyncClient::new(test_config(&listener), recorder.clone()).start(cancel.clone());

        let bogus = SerializedUpdate {
            key: "/calico/v1/config/bad".to_string(),
            value: Some(serde_json::json!({"type": "bogus"})),
            revision: "1".to_string(),
            ttl_secs: None,
            update_type: UpdateType::New,
        };

        // A bad entry in the snapshot closes the connection before anything
        // is delivered.
        {
            let (mut reader, mut writer) = accept_with_hello(&listener).await;
            writer
                .write(&Envelope::kvs(
                    vec![entry("a", "1", "1"), bogus.clone()],
                    KvsPhase::SnapshotEnd,
                ))
                .await
                .unwrap();
            let closed = tokio::time::timeout(Duration::from_secs(5), reader.read())
                .await
                .unwrap();
            assert!(closed.is_err());
        }
        assert!(recorder.is_empty());

        // Same for an incremental batch once in sync.
        {
            let (mut reader, mut writer) = accept_with_hello(&listener).await;
            writer
                .write(&Envelope::kvs(vec![entry("a", "1", "1")], KvsPhase::SnapshotEnd))
                .await
                .unwrap();
            writer.write(&Envelope::status(SyncStatus::InSync)).await.unwrap();
            wait_for_state(&handle, ConnectionState::InSync).await;

            writer
                .write(&Envelope::kvs(vec![bogus], KvsPhase::Incremental))
                .await
                .unwrap();
            let closed = tokio::time::timeout(Duration::from_secs(5), reader.read())
                .await
                .unwrap();
            assert!(closed.is_err());
        }

        let _third = tokio::time::timeout(Duration::from_secs(5), accept_with_hello(&listener))
            .await
            .unwrap();
        assert_eq!(recorder.len(), 1);
        assert!(recorder.get("/calico/v1/config/bad").is_none());

        cancel.cancel();
        handle.finished().wait().await;
    }

    #[tokio::test]
    async fn test_one_shot_client_finishes_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let recorder = Arc::new(StateRecorder::new());
        let config = test_config(&listener).with_reconnect(false);
        let handle = SyncClient::new(config, recorder).start(CancellationToken::new());

        let (reader, writer) = accept_with_hello(&listener).await;
        drop((reader, writer));

        tokio::time::timeout(Duration::from_secs(5), handle.finished().wait())
            .await
            .unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_max_retries_gives_up() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let config = ClientConfig::new(addr)
            .with_backoff(Duration::from_millis(5), Duration::from_millis(10))
            .with_max_retries(3);
        let handle = SyncClient::new(config, StateRecorder::new()).start(CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(5), handle.finished().wait())
            .await
            .unwrap();
    }
}
