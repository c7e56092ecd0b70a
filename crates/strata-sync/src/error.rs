//! # Sync Error Types
//!
//! Error types for the cache, server, client and codec.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  ConfigLoad     │  │  Disconnected   │  │  FrameTooLarge          │ │
//! │  │  Bind           │  │  Timeout        │  │  DeserializationFailed  │ │
//! │  │                 │  │  Heartbeat      │  │  UnexpectedMessageType  │ │
//! │  │                 │  │  Io             │  │  InvalidUpdate          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Every transport and protocol error is fatal to ONE connection only.   │
//! │  The server closes it; the client reconnects with backoff.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all connection, codec and configuration failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to bind the listening socket.
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// Failed to establish a TCP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer closed the connection.
    #[error("Connection closed by peer")]
    Disconnected,

    /// A bounded operation took too long.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    /// The peer stopped answering pings.
    #[error("No pong received for {elapsed_ms}ms")]
    HeartbeatTimeout { elapsed_ms: u64 },

    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Structurally invalid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Frame length prefix out of bounds.
    #[error("Frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// A message arrived that is not valid in the current state.
    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType {
        expected: &'static str,
        actual: &'static str,
    },

    /// An update inside a KVs message could not be decoded.
    #[error("Invalid update: {0}")]
    InvalidUpdate(#[from] strata_core::CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::BindFailed { .. }
        )
    }

    /// Returns true if the peer violated the wire protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::FrameTooLarge { .. }
                | SyncError::SerializationFailed(_)
                | SyncError::DeserializationFailed(_)
                | SyncError::UnexpectedMessageType { .. }
                | SyncError::InvalidUpdate(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors() {
        assert!(SyncError::InvalidConfig("bad config".into()).is_config_error());
        assert!(SyncError::BindFailed {
            addr: "0.0.0.0:5473".into(),
            reason: "in use".into(),
        }
        .is_config_error());
        assert!(!SyncError::Disconnected.is_config_error());
    }

    #[test]
    fn test_protocol_errors() {
        assert!(SyncError::FrameTooLarge { size: 10, max: 5 }.is_protocol_error());
        assert!(SyncError::UnexpectedMessageType {
            expected: "client_hello",
            actual: "ping",
        }
        .is_protocol_error());
        assert!(!SyncError::Disconnected.is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Timeout {
            operation: "hello",
            after_ms: 10_000,
        };
        assert_eq!(err.to_string(), "hello timed out after 10000ms");

        let err = SyncError::UnexpectedMessageType {
            expected: "client_hello",
            actual: "kvs",
        };
        assert!(err.to_string().contains("client_hello"));
        assert!(err.to_string().contains("kvs"));
    }
}
