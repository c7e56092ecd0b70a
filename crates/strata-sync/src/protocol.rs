//! # Wire Protocol
//!
//! Message types and framing for the server ⇄ client stream.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  CLIENT ───► ClientHello { hostname, version, info }                   │
//! │  SERVER ───► ServerHello { version, protocol_version }                 │
//! │                                                                         │
//! │  SNAPSHOT (once per connection)                                        │
//! │  ──────────────────────────────                                        │
//! │  SERVER ───► Kvs { kvs: [...], phase: snapshot }       (0..n chunks)   │
//! │  SERVER ───► Kvs { kvs: [...], phase: snapshot_end }   (exactly 1)     │
//! │  SERVER ───► StatusUpdate { status }                                   │
//! │                                                                         │
//! │  STREAMING                                                             │
//! │  ─────────                                                             │
//! │  SERVER ───► Kvs { kvs: [...], phase: incremental }                    │
//! │  SERVER ───► StatusUpdate { status }          (only when it changes)   │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  SERVER ───► Ping { timestamp }                                        │
//! │  CLIENT ───► Pong { ping_timestamp, pong_timestamp }                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Each envelope is a length-prefixed frame holding adjacently tagged JSON:
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────────────┐
//! │ 4 bytes      │ N bytes                                             │
//! │ length (BE)  │ {"type":"ping","payload":{"timestamp":"..."}}       │
//! └──────────────┴─────────────────────────────────────────────────────┘
//! ```
//!
//! Unknown message kinds are a hard decode failure. A receiver that gets
//! one closes the connection: older peers cannot silently skip messages
//! they don't understand.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{SerializedUpdate, SyncStatus};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SyncError, SyncResult};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default upper bound on a frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Envelope (Tagged Union)
// =============================================================================

/// One framed protocol message.
///
/// Uses serde's adjacently tagged enum:
/// `{ "type": "client_hello", "payload": { ... } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    // =========================================================================
    // Handshake Messages
    // =========================================================================
    /// First message on every connection, client to server.
    ClientHello(MsgClientHello),

    /// Server's reply to the hello.
    ServerHello(MsgServerHello),

    // =========================================================================
    // Data Messages
    // =========================================================================
    /// Snapshot chunk or incremental batch of updates.
    Kvs(MsgKvs),

    /// Sync status transition.
    StatusUpdate(MsgStatusUpdate),

    // =========================================================================
    // Keepalive Messages
    // =========================================================================
    Ping(MsgPing),

    Pong(MsgPong),
}

// =============================================================================
// Handshake Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgClientHello {
    pub hostname: String,
    /// Client software version.
    pub version: String,
    /// Free-form description of the client.
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgServerHello {
    /// Server software version.
    pub version: String,
    pub protocol_version: u32,
}

// =============================================================================
// Data Payloads
// =============================================================================

/// Where a `Kvs` message sits in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvsPhase {
    /// Part of the initial snapshot, more chunks follow.
    Snapshot,
    /// Final chunk of the initial snapshot.
    SnapshotEnd,
    /// Updates applied after the snapshot.
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgKvs {
    pub kvs: Vec<SerializedUpdate>,
    pub phase: KvsPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgStatusUpdate {
    pub status: SyncStatus,
}

// =============================================================================
// Keepalive Payloads
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPing {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPong {
    pub ping_timestamp: DateTime<Utc>,
    pub pong_timestamp: DateTime<Utc>,
}

// =============================================================================
// Envelope Helpers
// =============================================================================

impl Envelope {
    /// Returns the message kind for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::ClientHello(_) => "client_hello",
            Envelope::ServerHello(_) => "server_hello",
            Envelope::Kvs(_) => "kvs",
            Envelope::StatusUpdate(_) => "status_update",
            Envelope::Ping(_) => "ping",
            Envelope::Pong(_) => "pong",
        }
    }

    pub fn client_hello(hostname: &str, version: &str, info: &str) -> Self {
        Envelope::ClientHello(MsgClientHello {
            hostname: hostname.to_string(),
            version: version.to_string(),
            info: info.to_string(),
        })
    }

    pub fn server_hello(version: &str) -> Self {
        Envelope::ServerHello(MsgServerHello {
            version: version.to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    /// Creates a ping stamped with the current time.
    pub fn ping() -> Self {
        Envelope::Ping(MsgPing {
            timestamp: Utc::now(),
        })
    }

    /// Creates the pong answering `ping`.
    pub fn pong(ping: &MsgPing) -> Self {
        Envelope::Pong(MsgPong {
            ping_timestamp: ping.timestamp,
            pong_timestamp: Utc::now(),
        })
    }

    pub fn status(status: SyncStatus) -> Self {
        Envelope::StatusUpdate(MsgStatusUpdate { status })
    }

    pub fn kvs(kvs: Vec<SerializedUpdate>, phase: KvsPhase) -> Self {
        Envelope::Kvs(MsgKvs { kvs, phase })
    }

    /// Encodes the envelope into a complete frame (header included).
    pub fn encode(&self) -> SyncResult<Bytes> {
        let mut buf = BytesMut::with_capacity(256);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(&self, buf: &mut BytesMut) -> SyncResult<()> {
        let payload =
            serde_json::to_vec(self).map_err(|e| SyncError::SerializationFailed(e.to_string()))?;
        let len = u32::try_from(payload.len()).map_err(|_| SyncError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;

        buf.reserve(FRAME_HEADER_LEN + payload.len());
        buf.put_u32(len);
        buf.put_slice(&payload);
        Ok(())
    }

    /// Decodes a frame payload (without its length prefix).
    pub fn decode(payload: &[u8]) -> SyncResult<Self> {
        serde_json::from_slice(payload).map_err(|e| SyncError::DeserializationFailed(e.to_string()))
    }
}

// =============================================================================
// Framed Reader / Writer
// =============================================================================

/// Reads length-prefixed envelopes from a byte stream.
pub struct EnvelopeReader<R> {
    inner: R,
    max_frame_size: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        EnvelopeReader {
            inner,
            max_frame_size,
            buf: Vec::new(),
        }
    }

    /// Reads the next envelope.
    ///
    /// ## Errors
    /// - `Disconnected` on a clean EOF between frames
    /// - `FrameTooLarge` / `InvalidMessage` when the header is out of bounds,
    ///   checked before the payload is allocated
    /// - `DeserializationFailed` for malformed JSON or unknown kinds
    pub async fn read(&mut self) -> SyncResult<Envelope> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if let Err(e) = self.inner.read_exact(&mut header).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => SyncError::Disconnected,
                _ => SyncError::Io(e),
            });
        }

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Err(SyncError::InvalidMessage("empty frame".into()));
        }
        if len > self.max_frame_size {
            return Err(SyncError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        self.buf.resize(len, 0);
        self.inner.read_exact(&mut self.buf).await?;
        Envelope::decode(&self.buf)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes length-prefixed envelopes to a byte stream.
pub struct EnvelopeWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    pub fn new(inner: W) -> Self {
        EnvelopeWriter {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Writes one envelope and flushes it.
    pub async fn write(&mut self, envelope: &Envelope) -> SyncResult<()> {
        self.buf.clear();
        envelope.encode_into(&mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::UpdateType;

    #[test]
    fn test_message_serialization() {
        let msg = Envelope::client_hello("node-1", "v1.2.3", "agent");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"client_hello\""));
        assert!(json.contains("\"hostname\":\"node-1\""));

        let status = Envelope::status(SyncStatus::InSync);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"type\":\"status_update\""));
        assert!(json.contains("\"in_sync\""));
    }

    #[test]
    fn test_frame_header_matches_payload() {
        let frame = Envelope::ping().encode().unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
        let decoded = Envelope::decode(&frame[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(decoded.type_name(), "ping");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = Envelope::decode(br#"{"type":"gossip","payload":{}}"#).unwrap_err();
        assert!(err.is_protocol_error());

        let err = Envelope::decode(br#"{"payload":{}}"#).unwrap_err();
        assert!(err.is_protocol_error());

        let err = Envelope::decode(b"null").unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_kvs_with_wrong_shape_is_rejected() {
        let err = Envelope::decode(br#"{"type":"kvs","payload":{"kvs":42,"phase":"snapshot"}}"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::DeserializationFailed(_)));
    }

    #[test]
    fn test_pong_echoes_ping_timestamp() {
        let Envelope::Ping(ping) = Envelope::ping() else {
            panic!("expected ping");
        };
        let Envelope::Pong(pong) = Envelope::pong(&ping) else {
            panic!("expected pong");
        };
        assert_eq!(pong.ping_timestamp, ping.timestamp);
        assert!(pong.pong_timestamp >= ping.timestamp);
    }

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = EnvelopeWriter::new(client);
        let mut reader = EnvelopeReader::new(server, DEFAULT_MAX_FRAME_SIZE);

        let kvs = Envelope::kvs(
            vec![SerializedUpdate {
                key: "/calico/v1/config/foobar".to_string(),
                value: Some(serde_json::json!({"type": "text", "data": "bazzbiff"})),
                revision: "1234".to_string(),
                ttl_secs: None,
                update_type: UpdateType::New,
            }],
            KvsPhase::SnapshotEnd,
        );
        writer.write(&kvs).await.unwrap();
        writer.write(&Envelope::status(SyncStatus::InSync)).await.unwrap();

        assert_eq!(reader.read().await.unwrap(), kvs);
        assert_eq!(
            reader.read().await.unwrap(),
            Envelope::status(SyncStatus::InSync)
        );

        drop(writer);
        assert!(matches!(reader.read().await, Err(SyncError::Disconnected)));
    }

    #[tokio::test]
    async fn test_garbage_header_fails_fast() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = EnvelopeReader::new(server, DEFAULT_MAX_FRAME_SIZE);

        client
            .write_all(b"dsjfkldjsklfajdskjfk;dajskfjaoirefmuweioufijsdkfjkdsjkfjasd;")
            .await
            .unwrap();

        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, SyncError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_empty_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = EnvelopeReader::new(server, DEFAULT_MAX_FRAME_SIZE);

        client.write_all(&0u32.to_be_bytes()).await.unwrap();

        let err = reader.read().await.unwrap_err();
        assert!(err.is_protocol_error());
    }
}
