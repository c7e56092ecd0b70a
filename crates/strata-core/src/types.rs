//! # Domain Types
//!
//! Core data model shared by the cache, the server and the client.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  ResourceKey    │   │ ResourceValue   │   │    Update       │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  GlobalConfig   │   │  Text           │   │  kv: KvPair     │       │
//! │  │  HostConfig     │   │  HostIp         │   │  update_type    │       │
//! │  │  HostIp         │   │  Node           │   └────────┬────────┘       │
//! │  │  Node           │   │  Json           │            │ serialize      │
//! │  │  Generic        │   └─────────────────┘            ▼                │
//! │  └─────────────────┘                         ┌─────────────────┐       │
//! │                                              │SerializedUpdate │       │
//! │  ┌─────────────────┐   ┌─────────────────┐   │  ─────────────  │       │
//! │  │  SyncStatus     │   │  UpdateType     │   │  key (path)     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  value (JSON)   │       │
//! │  │  WaitingFor...  │   │  New            │   │  revision       │       │
//! │  │  ResyncIn...    │   │  Updated        │   └─────────────────┘       │
//! │  │  InSync         │   │  Deleted        │                             │
//! │  └─────────────────┘   └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Every key has a canonical *default path* (`/calico/v1/config/foobar`).
//! Snapshots are keyed by that path, so two keys with the same path are the
//! same resource.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Path Layout
// =============================================================================

const PATH_PREFIX: &str = "calico";
const PATH_VERSION: &str = "v1";

// =============================================================================
// Resource Key
// =============================================================================

/// Identifies a resource in the datastore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceKey {
    /// Cluster-wide configuration parameter.
    GlobalConfig { name: String },
    /// Per-host configuration parameter.
    HostConfig { hostname: String, name: String },
    /// The routing IP of a host.
    HostIp { hostname: String },
    /// A full node record. Composite: it has no default path and is
    /// reduced to a `HostIp` by validation before reaching the cache.
    Node { hostname: String },
    /// Any other resource, addressed by its path.
    Generic { path: String },
}

impl ResourceKey {
    /// Creates a global config key.
    pub fn global_config(name: impl Into<String>) -> Self {
        ResourceKey::GlobalConfig { name: name.into() }
    }

    /// Creates a host IP key.
    pub fn host_ip(hostname: impl Into<String>) -> Self {
        ResourceKey::HostIp {
            hostname: hostname.into(),
        }
    }

    /// Creates a node key.
    pub fn node(hostname: impl Into<String>) -> Self {
        ResourceKey::Node {
            hostname: hostname.into(),
        }
    }

    /// Short name of the key kind, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKey::GlobalConfig { .. } => "global_config",
            ResourceKey::HostConfig { .. } => "host_config",
            ResourceKey::HostIp { .. } => "host_ip",
            ResourceKey::Node { .. } => "node",
            ResourceKey::Generic { .. } => "generic",
        }
    }

    /// Returns the canonical path of this key.
    ///
    /// ## Errors
    /// `Node` keys have no path of their own.
    pub fn default_path(&self) -> CoreResult<String> {
        match self {
            ResourceKey::GlobalConfig { name } => {
                Ok(format!("/{PATH_PREFIX}/{PATH_VERSION}/config/{name}"))
            }
            ResourceKey::HostConfig { hostname, name } => Ok(format!(
                "/{PATH_PREFIX}/{PATH_VERSION}/host/{hostname}/config/{name}"
            )),
            ResourceKey::HostIp { hostname } => {
                Ok(format!("/{PATH_PREFIX}/{PATH_VERSION}/host/{hostname}/bird_ip"))
            }
            ResourceKey::Node { .. } => Err(CoreError::NoDefaultPath { kind: self.kind() }),
            ResourceKey::Generic { path } => Ok(path.clone()),
        }
    }

    /// Parses a default path back into a key.
    ///
    /// ## Layouts
    /// ```text
    /// /calico/v1/config/<name>                   → GlobalConfig
    /// /calico/v1/host/<hostname>/config/<name>   → HostConfig
    /// /calico/v1/host/<hostname>/bird_ip         → HostIp
    /// anything else starting with '/'            → Generic
    /// ```
    pub fn from_path(path: &str) -> CoreResult<Self> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(CoreError::InvalidPath {
                path: path.to_string(),
                reason: "must start with '/'".to_string(),
            });
        };

        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CoreError::InvalidPath {
                path: path.to_string(),
                reason: "empty path segment".to_string(),
            });
        }

        let key = match segments.as_slice() {
            [PATH_PREFIX, PATH_VERSION, "config", name] => ResourceKey::GlobalConfig {
                name: name.to_string(),
            },
            [PATH_PREFIX, PATH_VERSION, "host", hostname, "config", name] => {
                ResourceKey::HostConfig {
                    hostname: hostname.to_string(),
                    name: name.to_string(),
                }
            }
            [PATH_PREFIX, PATH_VERSION, "host", hostname, "bird_ip"] => ResourceKey::HostIp {
                hostname: hostname.to_string(),
            },
            _ => ResourceKey::Generic {
                path: path.to_string(),
            },
        };
        Ok(key)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.default_path() {
            Ok(path) => write!(f, "{path}"),
            Err(_) => match self {
                ResourceKey::Node { hostname } => write!(f, "node({hostname})"),
                other => write!(f, "{}", other.kind()),
            },
        }
    }
}

// =============================================================================
// Resource Value
// =============================================================================

/// Node record as published by the datastore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// IPv4 address, optionally with a prefix length (`10.0.0.1/24`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    /// IPv6 address, optionally with a prefix length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The value stored against a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResourceValue {
    Text(String),
    HostIp(IpAddr),
    Node(NodeSpec),
    Json(serde_json::Value),
}

impl ResourceValue {
    /// Short name of the value variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceValue::Text(_) => "text",
            ResourceValue::HostIp(_) => "host_ip",
            ResourceValue::Node(_) => "node",
            ResourceValue::Json(_) => "json",
        }
    }

    /// Encodes the value into its JSON wire form.
    pub fn to_json(&self) -> CoreResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes a value from its JSON wire form.
    pub fn from_json(value: serde_json::Value) -> CoreResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl From<&str> for ResourceValue {
    fn from(s: &str) -> Self {
        ResourceValue::Text(s.to_string())
    }
}

impl From<IpAddr> for ResourceValue {
    fn from(ip: IpAddr) -> Self {
        ResourceValue::HostIp(ip)
    }
}

// =============================================================================
// KV Pair / Update
// =============================================================================

/// A key, its value and the datastore revision that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: ResourceKey,
    /// `None` means the key is being removed.
    #[serde(default)]
    pub value: Option<ResourceValue>,
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl KvPair {
    pub fn new(key: ResourceKey, value: Option<ResourceValue>, revision: impl Into<String>) -> Self {
        KvPair {
            key,
            value,
            revision: revision.into(),
            ttl_secs: None,
        }
    }
}

/// Kind of change carried by an [`Update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    New,
    Updated,
    Deleted,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateType::New => write!(f, "new"),
            UpdateType::Updated => write!(f, "updated"),
            UpdateType::Deleted => write!(f, "deleted"),
        }
    }
}

/// One change to the datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub kv: KvPair,
    pub update_type: UpdateType,
}

impl Update {
    /// Creates a `New` update.
    pub fn new(key: ResourceKey, value: ResourceValue, revision: impl Into<String>) -> Self {
        Update {
            kv: KvPair::new(key, Some(value), revision),
            update_type: UpdateType::New,
        }
    }

    /// Creates a `Deleted` update.
    pub fn deletion(key: ResourceKey, revision: impl Into<String>) -> Self {
        Update {
            kv: KvPair::new(key, None, revision),
            update_type: UpdateType::Deleted,
        }
    }

    /// An update removes its key when it is a deletion or carries no value.
    pub fn is_deletion(&self) -> bool {
        self.update_type == UpdateType::Deleted || self.kv.value.is_none()
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Progress of the datastore resync.
///
/// ```text
/// WaitingForDatastore ──▶ ResyncInProgress ──▶ InSync
///                               ▲                 │
///                               └─── new resync ──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    WaitingForDatastore,
    ResyncInProgress,
    InSync,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::WaitingForDatastore => write!(f, "waiting-for-datastore"),
            SyncStatus::ResyncInProgress => write!(f, "resync-in-progress"),
            SyncStatus::InSync => write!(f, "in-sync"),
        }
    }
}

// =============================================================================
// Serialized Update
// =============================================================================

/// The cache and wire form of an [`Update`]: the key reduced to its default
/// path and the value to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedUpdate {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    pub update_type: UpdateType,
}

impl SerializedUpdate {
    /// Serializes an update.
    ///
    /// Deletions always serialize with `value: None`, whatever they carried.
    /// Keys whose path would not parse back on the receiving side are
    /// rejected here.
    pub fn from_update(update: &Update) -> CoreResult<Self> {
        let key = update.kv.key.default_path()?;
        ResourceKey::from_path(&key)?;
        let value = if update.is_deletion() {
            None
        } else {
            update.kv.value.as_ref().map(ResourceValue::to_json).transpose()?
        };
        let update_type = if value.is_none() {
            UpdateType::Deleted
        } else {
            update.update_type
        };

        Ok(SerializedUpdate {
            key,
            value,
            revision: update.kv.revision.clone(),
            ttl_secs: update.kv.ttl_secs,
            update_type,
        })
    }

    /// Rebuilds the update, re-parsing the key path and the value.
    pub fn to_update(&self) -> CoreResult<Update> {
        let key = ResourceKey::from_path(&self.key)?;
        let value = self
            .value
            .clone()
            .map(ResourceValue::from_json)
            .transpose()?;

        Ok(Update {
            kv: KvPair {
                key,
                value,
                revision: self.revision.clone(),
                ttl_secs: self.ttl_secs,
            },
            update_type: self.update_type,
        })
    }

    pub fn is_deletion(&self) -> bool {
        self.value.is_none()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_default_paths() {
        assert_eq!(
            ResourceKey::global_config("foobar").default_path().unwrap(),
            "/calico/v1/config/foobar"
        );
        assert_eq!(
            ResourceKey::host_ip("node-1").default_path().unwrap(),
            "/calico/v1/host/node-1/bird_ip"
        );
        let host_config = ResourceKey::HostConfig {
            hostname: "node-1".to_string(),
            name: "LogSeverity".to_string(),
        };
        assert_eq!(
            host_config.default_path().unwrap(),
            "/calico/v1/host/node-1/config/LogSeverity"
        );
    }

    #[test]
    fn test_node_key_has_no_path() {
        let err = ResourceKey::node("node-1").default_path().unwrap_err();
        assert!(matches!(err, CoreError::NoDefaultPath { kind: "node" }));
        assert_eq!(ResourceKey::node("node-1").to_string(), "node(node-1)");
    }

    #[test]
    fn test_path_parsing() {
        assert_eq!(
            ResourceKey::from_path("/calico/v1/config/foobar").unwrap(),
            ResourceKey::global_config("foobar")
        );
        assert_eq!(
            ResourceKey::from_path("/calico/v1/host/h1/bird_ip").unwrap(),
            ResourceKey::host_ip("h1")
        );
        assert_eq!(
            ResourceKey::from_path("/calico/v1/policy/tier/default").unwrap(),
            ResourceKey::Generic {
                path: "/calico/v1/policy/tier/default".to_string()
            }
        );
        assert!(ResourceKey::from_path("calico/v1/config/foobar").is_err());
        assert!(ResourceKey::from_path("/calico//config").is_err());
    }

    #[test]
    fn test_prefix_keys_stay_distinct() {
        let a = ResourceKey::global_config("foobar").default_path().unwrap();
        let b = ResourceKey::global_config("foobar2").default_path().unwrap();
        assert_ne!(a, b);
        assert!(b.starts_with(&a));
    }

    #[test]
    fn test_serialized_update_conversion() {
        let update = Update::new(
            ResourceKey::host_ip("h1"),
            ResourceValue::HostIp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            "42",
        );
        let serialized = SerializedUpdate::from_update(&update).unwrap();
        assert_eq!(serialized.key, "/calico/v1/host/h1/bird_ip");
        assert_eq!(serialized.update_type, UpdateType::New);
        assert_eq!(serialized.to_update().unwrap(), update);
    }

    #[test]
    fn test_valueless_update_serializes_as_deletion() {
        let update = Update {
            kv: KvPair::new(ResourceKey::global_config("foobar2"), None, "1238"),
            update_type: UpdateType::Updated,
        };
        assert!(update.is_deletion());
        let serialized = SerializedUpdate::from_update(&update).unwrap();
        assert_eq!(serialized.update_type, UpdateType::Deleted);
        assert!(serialized.is_deletion());
    }

    #[test]
    fn test_unparseable_paths_are_rejected_on_serialize() {
        let relative = Update::new(
            ResourceKey::Generic {
                path: "no-leading-slash".into(),
            },
            "v".into(),
            "1",
        );
        assert!(matches!(
            SerializedUpdate::from_update(&relative),
            Err(CoreError::InvalidPath { .. })
        ));

        let unnamed = Update::new(ResourceKey::global_config(""), "v".into(), "1");
        assert!(matches!(
            SerializedUpdate::from_update(&unnamed),
            Err(CoreError::InvalidPath { .. })
        ));

        let nested = Update::new(
            ResourceKey::Generic {
                path: "/calico/v1/policy/tier/default".into(),
            },
            "v".into(),
            "1",
        );
        let serialized = SerializedUpdate::from_update(&nested).unwrap();
        assert_eq!(serialized.to_update().unwrap().kv.key, nested.kv.key);
    }

    #[test]
    fn test_structurally_invalid_value_fails_to_decode() {
        let serialized = SerializedUpdate {
            key: "/calico/v1/config/foobar".to_string(),
            value: Some(serde_json::json!({"type": "bogus", "data": 1})),
            revision: "1".to_string(),
            ttl_secs: None,
            update_type: UpdateType::New,
        };
        assert!(serialized.to_update().is_err());
    }

    #[test]
    fn test_sync_status_display() {
        assert_eq!(SyncStatus::default(), SyncStatus::WaitingForDatastore);
        assert_eq!(SyncStatus::InSync.to_string(), "in-sync");
        let json = serde_json::to_string(&SyncStatus::ResyncInProgress).unwrap();
        assert_eq!(json, "\"resync_in_progress\"");
    }
}
