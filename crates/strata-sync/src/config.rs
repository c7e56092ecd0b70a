//! # Strata Configuration
//!
//! File-backed settings for the cache, the server, the client and the admin
//! endpoint.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     STRATA_PORT=5473                                                   │
//! │     STRATA_MAX_CONNS=200                                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/strata/strata.toml (Linux)                               │
//! │     ~/Library/Application Support/io.strata.strata/strata.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [cache]
//! max_batch_size = 100
//! wake_up_interval_ms = 100
//!
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 5473
//! max_conns = 0           # 0 = unlimited
//! drop_interval_ms = 1000
//! ping_interval_secs = 10
//! pong_timeout_secs = 60
//!
//! [client]
//! server_addr = "127.0.0.1:5473"
//! max_retries = 0         # 0 = infinite
//!
//! [admin]
//! enabled = true
//! port = 9093
//! ```
//!
//! The settings structs here mirror the file. The runtime structs
//! ([`CacheConfig`], [`ServerConfig`], [`ClientConfig`]) are built from them
//! with `From` and carry `Duration`s instead of integer fields.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::ClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::server::ServerConfig;
use crate::snapcache::CacheConfig;

// =============================================================================
// Cache Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Pending updates that force a breadcrumb to be published.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Flush period for partial batches (milliseconds).
    #[serde(default = "default_wake_up_interval")]
    pub wake_up_interval_ms: u64,
}

fn default_max_batch_size() -> usize {
    100
}

fn default_wake_up_interval() -> u64 {
    100
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            max_batch_size: default_max_batch_size(),
            wake_up_interval_ms: default_wake_up_interval(),
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        CacheConfig {
            max_batch_size: settings.max_batch_size,
            wake_up_interval: Duration::from_millis(settings.wake_up_interval_ms),
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

/// Listener, admission control and heartbeat settings.
///
/// ## Admission Control
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  max_conns = 0      → unlimited                                        │
/// │  max_conns = N      → every drop_interval (+ up to 10% jitter) the     │
/// │                       oldest connection above N is closed, one per tick│
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Listening port; 0 picks a random free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection limit; 0 means unlimited.
    #[serde(default)]
    pub max_conns: usize,

    #[serde(default = "default_drop_interval")]
    pub drop_interval_ms: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Must be longer than `ping_interval_secs`.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_secs: u64,

    #[serde(default = "default_server_write_timeout")]
    pub write_timeout_secs: u64,

    /// Largest number of KVs sent in one message.
    #[serde(default = "default_max_kvs_per_message")]
    pub max_kvs_per_message: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5473
}

fn default_drop_interval() -> u64 {
    1000
}

fn default_ping_interval() -> u64 {
    10
}

fn default_pong_timeout() -> u64 {
    60
}

fn default_hello_timeout() -> u64 {
    10
}

fn default_server_write_timeout() -> u64 {
    120
}

fn default_max_kvs_per_message() -> usize {
    100
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_conns: 0,
            drop_interval_ms: default_drop_interval(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            hello_timeout_secs: default_hello_timeout(),
            write_timeout_secs: default_server_write_timeout(),
            max_kvs_per_message: default_max_kvs_per_message(),
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        ServerConfig {
            bind_addr: settings.bind_addr.clone(),
            port: settings.port,
            max_conns: (settings.max_conns > 0).then_some(settings.max_conns),
            drop_interval: Duration::from_millis(settings.drop_interval_ms),
            ping_interval: Duration::from_secs(settings.ping_interval_secs),
            pong_timeout: Duration::from_secs(settings.pong_timeout_secs),
            hello_timeout: Duration::from_secs(settings.hello_timeout_secs),
            write_timeout: Duration::from_secs(settings.write_timeout_secs),
            max_kvs_per_message: settings.max_kvs_per_message,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

// =============================================================================
// Client Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// `host:port` of the server.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Name sent in the hello; empty generates one.
    #[serde(default)]
    pub hostname: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_client_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Reconnection attempts before giving up; 0 retries forever.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_server_addr() -> String {
    "127.0.0.1:5473".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_client_write_timeout() -> u64 {
    10
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            server_addr: default_server_addr(),
            hostname: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_client_write_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_retries: 0,
        }
    }
}

impl From<&ClientSettings> for ClientConfig {
    fn from(settings: &ClientSettings) -> Self {
        let hostname = if settings.hostname.is_empty() {
            format!("strata-client-{}", Uuid::new_v4())
        } else {
            settings.hostname.clone()
        };

        ClientConfig::new(settings.server_addr.clone())
            .with_hostname(hostname)
            .with_connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .with_read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .with_write_timeout(Duration::from_secs(settings.write_timeout_secs))
            .with_backoff(
                Duration::from_millis(settings.initial_backoff_ms),
                Duration::from_secs(settings.max_backoff_secs),
            )
            .with_max_retries(settings.max_retries)
    }
}

// =============================================================================
// Admin Settings
// =============================================================================

/// HTTP endpoint serving `/metrics` and `/readiness`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_admin_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_admin_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_admin_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9093
}

impl Default for AdminSettings {
    fn default() -> Self {
        AdminSettings {
            enabled: true,
            bind_addr: default_admin_bind_addr(),
            port: default_admin_port(),
        }
    }
}

impl AdminSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub admin: AdminSettings,
}

impl StrataConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (strata.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(format!("{}: {e}", path.display())))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.cache.max_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "cache.max_batch_size must be greater than 0".into(),
            ));
        }
        if self.cache.wake_up_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "cache.wake_up_interval_ms must be greater than 0".into(),
            ));
        }

        let server = &self.server;
        if server.drop_interval_ms == 0 || server.ping_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "server intervals must be greater than 0".into(),
            ));
        }
        if server.pong_timeout_secs <= server.ping_interval_secs {
            return Err(SyncError::InvalidConfig(format!(
                "server.pong_timeout_secs ({}) must exceed server.ping_interval_secs ({})",
                server.pong_timeout_secs, server.ping_interval_secs
            )));
        }
        if server.hello_timeout_secs == 0 || server.write_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "server timeouts must be greater than 0".into(),
            ));
        }
        if server.max_kvs_per_message == 0 {
            return Err(SyncError::InvalidConfig(
                "server.max_kvs_per_message must be greater than 0".into(),
            ));
        }

        if self.client.server_addr.is_empty() {
            return Err(SyncError::InvalidConfig(
                "client.server_addr must not be empty".into(),
            ));
        }
        if self.client.initial_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "client.initial_backoff_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies `STRATA_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(var = name, value = %raw, "Ignoring unparseable environment override");
                    None
                }
            }
        }

        if let Some(addr) = lookup("STRATA_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(port) = parsed::<u16>("STRATA_PORT", lookup("STRATA_PORT")) {
            debug!(port, "Overriding server port from environment");
            self.server.port = port;
        }
        if let Some(max) = parsed::<usize>("STRATA_MAX_CONNS", lookup("STRATA_MAX_CONNS")) {
            self.server.max_conns = max;
        }
        if let Some(ms) = parsed::<u64>("STRATA_DROP_INTERVAL_MS", lookup("STRATA_DROP_INTERVAL_MS")) {
            self.server.drop_interval_ms = ms;
        }
        if let Some(secs) = parsed::<u64>("STRATA_PING_INTERVAL_SECS", lookup("STRATA_PING_INTERVAL_SECS")) {
            self.server.ping_interval_secs = secs;
        }
        if let Some(secs) = parsed::<u64>("STRATA_PONG_TIMEOUT_SECS", lookup("STRATA_PONG_TIMEOUT_SECS")) {
            self.server.pong_timeout_secs = secs;
        }
        if let Some(size) = parsed::<usize>("STRATA_MAX_BATCH_SIZE", lookup("STRATA_MAX_BATCH_SIZE")) {
            self.cache.max_batch_size = size;
        }
        if let Some(ms) = parsed::<u64>("STRATA_WAKE_UP_INTERVAL_MS", lookup("STRATA_WAKE_UP_INTERVAL_MS")) {
            self.cache.wake_up_interval_ms = ms;
        }
        if let Some(port) = parsed::<u16>("STRATA_ADMIN_PORT", lookup("STRATA_ADMIN_PORT")) {
            self.admin.port = port;
        }
        if let Some(addr) = lookup("STRATA_SERVER_ADDR") {
            debug!(addr = %addr, "Overriding server address from environment");
            self.client.server_addr = addr;
        }
        if let Some(hostname) = lookup("STRATA_HOSTNAME") {
            self.client.hostname = hostname;
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "strata", "strata")
            .map(|dirs| dirs.config_dir().join("strata.toml"))
    }

    // =========================================================================
    // Runtime Configs
    // =========================================================================

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(&self.cache)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::from(&self.server)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::from(&self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = StrataConfig::default();
        assert_eq!(config.cache.max_batch_size, 100);
        assert_eq!(config.server.port, 5473);
        assert_eq!(config.server.max_conns, 0);
        assert!(config.admin.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: StrataConfig = toml::from_str(
            r#"
            [server]
            port = 0
            max_conns = 60
            drop_interval_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 0);
        assert_eq!(config.server.ping_interval_secs, 10);
        assert_eq!(config.cache.wake_up_interval_ms, 100);

        let server = config.server_config();
        assert_eq!(server.max_conns, Some(60));
        assert_eq!(server.drop_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_config_validation() {
        let mut config = StrataConfig::default();

        config.cache.max_batch_size = 0;
        assert!(config.validate().unwrap_err().is_config_error());
        config.cache.max_batch_size = 100;

        config.server.pong_timeout_secs = config.server.ping_interval_secs;
        assert!(config.validate().is_err());
        config.server.pong_timeout_secs = 60;

        config.server.max_kvs_per_message = 0;
        assert!(config.validate().is_err());
        config.server.max_kvs_per_message = 100;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STRATA_PORT", "6000"),
            ("STRATA_MAX_CONNS", "25"),
            ("STRATA_PING_INTERVAL_SECS", "not-a-number"),
            ("STRATA_HOSTNAME", "felix-1"),
        ]
        .into_iter()
        .collect();

        let mut config = StrataConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.max_conns, 25);
        assert_eq!(config.server.ping_interval_secs, 10);
        assert_eq!(config.client.hostname, "felix-1");
        assert_eq!(config.client_config().hostname, "felix-1");
    }

    #[test]
    fn test_empty_hostname_is_generated() {
        let config = StrataConfig::default();
        let client = config.client_config();
        assert!(client.hostname.starts_with("strata-client-"));
    }

    #[test]
    fn test_toml_serialization() {
        let config = StrataConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[admin]"));
    }
}
