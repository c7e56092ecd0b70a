//! # Validation Module
//!
//! Validation and normalization of the raw datastore stream before it
//! reaches the snapshot cache.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ValidationFilter                                   │
//! │                                                                         │
//! │  Update ──▶ validate_key ──✗──▶ dropped (no valid key to delete)       │
//! │                 │                                                       │
//! │                 ▼                                                       │
//! │           Node key? ──yes──▶ convert_node ──▶ HostIp update            │
//! │                 │                   │ (no usable IPv4)                  │
//! │                 │                   └──────▶ HostIp deletion           │
//! │                 ▼                                                       │
//! │         validate_value ──✗──▶ deletion of the same key                 │
//! │                 │                                                       │
//! │                 ▼                                                       │
//! │           forwarded unchanged                                           │
//! │                                                                         │
//! │  One input update yields zero or one output update, in input order.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Downstream caches never observe an invalid value but still see the key
//! transition, so a client that held the old value drops it.

use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, warn};

use crate::callbacks::SyncerCallbacks;
use crate::error::ValidationError;
use crate::types::{KvPair, NodeSpec, ResourceKey, ResourceValue, SyncStatus, Update, UpdateType};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest hostname or config name accepted in a key.
pub const MAX_NAME_LEN: usize = 253;

/// Longest config value accepted.
pub const MAX_CONFIG_VALUE_LEN: usize = 4096;

// =============================================================================
// Key Validators
// =============================================================================

/// Validates one path component of a key (hostname or config name).
///
/// ## Rules
/// - Must not be empty
/// - At most 253 bytes
/// - Must not contain `/` (it would change the key's path layout)
pub fn validate_name(field: &str, name: &str) -> ValidationResult<()> {
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_NAME_LEN,
        });
    }

    if name.contains('/') {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain '/'".to_string(),
        });
    }

    Ok(())
}

/// Validates a key's identifying fields.
pub fn validate_key(key: &ResourceKey) -> ValidationResult<()> {
    match key {
        ResourceKey::GlobalConfig { name } => validate_name("name", name),
        ResourceKey::HostConfig { hostname, name } => {
            validate_name("hostname", hostname)?;
            validate_name("name", name)
        }
        ResourceKey::HostIp { hostname } | ResourceKey::Node { hostname } => {
            validate_name("hostname", hostname)
        }
        ResourceKey::Generic { path } => {
            let Some(rest) = path.strip_prefix('/') else {
                return Err(ValidationError::InvalidFormat {
                    field: "path".to_string(),
                    reason: "must start with '/'".to_string(),
                });
            };
            if rest.split('/').any(str::is_empty) {
                return Err(ValidationError::InvalidFormat {
                    field: "path".to_string(),
                    reason: "must not contain empty segments".to_string(),
                });
            }
            Ok(())
        }
    }
}

// =============================================================================
// Value Validators
// =============================================================================

/// Validates a value against the rules of its key's kind.
///
/// ## Rules
/// | Key kind                     | Accepted value                      |
/// |------------------------------|-------------------------------------|
/// | GlobalConfig / HostConfig    | non-empty `Text`, at most 4096 bytes |
/// | HostIp                       | `HostIp`                            |
/// | Node                         | `Node` with a parseable IPv4        |
/// | Generic                      | anything except `Json(null)`        |
pub fn validate_value(key: &ResourceKey, value: &ResourceValue) -> ValidationResult<()> {
    match (key, value) {
        (ResourceKey::GlobalConfig { .. } | ResourceKey::HostConfig { .. }, ResourceValue::Text(text)) => {
            if text.is_empty() {
                return Err(ValidationError::Required {
                    field: "value".to_string(),
                });
            }
            if text.len() > MAX_CONFIG_VALUE_LEN {
                return Err(ValidationError::TooLong {
                    field: "value".to_string(),
                    max: MAX_CONFIG_VALUE_LEN,
                });
            }
            Ok(())
        }
        (ResourceKey::HostIp { .. }, ResourceValue::HostIp(_)) => Ok(()),
        (ResourceKey::Node { .. }, ResourceValue::Node(spec)) => parse_node_ipv4(spec).map(|_| ()),
        (ResourceKey::Generic { .. }, ResourceValue::Json(serde_json::Value::Null)) => {
            Err(ValidationError::Required {
                field: "value".to_string(),
            })
        }
        (ResourceKey::Generic { .. }, _) => Ok(()),
        (key, value) => Err(ValidationError::WrongValueKind {
            kind: key.kind(),
            actual: value.kind(),
        }),
    }
}

/// Extracts the node's IPv4 address, dropping any prefix length.
///
/// ## Example
/// ```rust
/// use strata_core::types::NodeSpec;
/// use strata_core::validation::parse_node_ipv4;
///
/// let spec = NodeSpec {
///     ipv4_address: Some("10.0.0.1/24".to_string()),
///     ..Default::default()
/// };
/// assert_eq!(parse_node_ipv4(&spec).unwrap().to_string(), "10.0.0.1");
/// ```
pub fn parse_node_ipv4(spec: &NodeSpec) -> ValidationResult<Ipv4Addr> {
    let raw = spec
        .ipv4_address
        .as_deref()
        .ok_or_else(|| ValidationError::Required {
            field: "ipv4_address".to_string(),
        })?;

    let addr = raw.split_once('/').map_or(raw, |(addr, _prefix)| addr);
    addr.parse().map_err(|_| ValidationError::InvalidFormat {
        field: "ipv4_address".to_string(),
        reason: format!("'{raw}' is not an IPv4 address"),
    })
}

// =============================================================================
// Normalization
// =============================================================================

/// Applies validation and per-kind conversion to one update.
///
/// Returns `None` only when the key itself is invalid.
pub fn normalize_update(update: Update) -> Option<Update> {
    if let Err(err) = validate_key(&update.kv.key) {
        warn!(key = %update.kv.key, error = %err, "Dropping update with invalid key");
        return None;
    }

    let node_hostname = match &update.kv.key {
        ResourceKey::Node { hostname } => Some(hostname.clone()),
        _ => None,
    };
    let normalized = match node_hostname {
        Some(hostname) => convert_node(hostname, update),
        None => validate_or_delete(update),
    };
    Some(normalized)
}

/// Rewrites an update into a deletion of the same key.
fn into_deletion(update: Update) -> Update {
    Update {
        kv: KvPair {
            value: None,
            ..update.kv
        },
        update_type: UpdateType::Deleted,
    }
}

fn validate_or_delete(update: Update) -> Update {
    if update.is_deletion() {
        return into_deletion(update);
    }
    let Some(value) = &update.kv.value else {
        return into_deletion(update);
    };

    match validate_value(&update.kv.key, value) {
        Ok(()) => update,
        Err(err) => {
            warn!(
                key = %update.kv.key,
                revision = %update.kv.revision,
                error = %err,
                "Value failed validation, treating as deletion"
            );
            into_deletion(update)
        }
    }
}

/// Reduces a node record to its routing IP.
fn convert_node(hostname: String, update: Update) -> Update {
    let host_ip_key = ResourceKey::HostIp { hostname };
    let Update { kv, update_type } = update;

    let ip = match (&kv.value, update_type) {
        (_, UpdateType::Deleted) | (None, _) => None,
        (Some(ResourceValue::Node(spec)), _) => match parse_node_ipv4(spec) {
            Ok(ip) => Some(ip),
            Err(err) => {
                debug!(key = %host_ip_key, error = %err, "Node has no usable IPv4");
                None
            }
        },
        (Some(other), _) => {
            warn!(
                key = %host_ip_key,
                actual = other.kind(),
                "Node value failed validation, treating as deletion"
            );
            None
        }
    };

    match ip {
        Some(ip) => Update {
            kv: KvPair {
                key: host_ip_key,
                value: Some(ResourceValue::HostIp(IpAddr::V4(ip))),
                revision: kv.revision,
                ttl_secs: kv.ttl_secs,
            },
            update_type,
        },
        None => Update {
            kv: KvPair {
                key: host_ip_key,
                value: None,
                revision: kv.revision,
                ttl_secs: kv.ttl_secs,
            },
            update_type: UpdateType::Deleted,
        },
    }
}

// =============================================================================
// Validation Filter
// =============================================================================

/// Pipeline stage that validates and normalizes updates before forwarding
/// them to the next stage.
pub struct ValidationFilter<S> {
    sink: S,
}

impl<S: SyncerCallbacks> ValidationFilter<S> {
    /// Creates a filter in front of `sink`.
    pub fn new(sink: S) -> Self {
        ValidationFilter { sink }
    }

    /// Returns the downstream stage.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: SyncerCallbacks> SyncerCallbacks for ValidationFilter<S> {
    fn on_updates(&self, updates: Vec<Update>) {
        let filtered: Vec<Update> = updates.into_iter().filter_map(normalize_update).collect();
        if filtered.is_empty() {
            return;
        }
        self.sink.on_updates(filtered);
    }

    fn on_status_updated(&self, status: SyncStatus) {
        self.sink.on_status_updated(status);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::StateRecorder;
    use std::sync::Arc;

    fn node_update(hostname: &str, value: ResourceValue) -> Update {
        Update::new(ResourceKey::node(hostname), value, "1234")
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("name", "foobar").is_ok());
        assert!(validate_name("name", "").is_err());
        assert!(validate_name("name", "a/b").is_err());
        assert!(validate_name("name", &"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_value_kinds() {
        let config = ResourceKey::global_config("foobar");
        assert!(validate_value(&config, &"bazzbiff".into()).is_ok());
        assert!(validate_value(&config, &"".into()).is_err());

        let host_ip = ResourceKey::host_ip("h1");
        assert_eq!(
            validate_value(&host_ip, &"10.0.0.1".into()),
            Err(ValidationError::WrongValueKind {
                kind: "host_ip",
                actual: "text",
            })
        );

        let generic = ResourceKey::Generic {
            path: "/calico/v1/policy/p1".to_string(),
        };
        assert!(validate_value(&generic, &ResourceValue::Json(serde_json::json!({"a": 1}))).is_ok());
        assert!(validate_value(&generic, &ResourceValue::Json(serde_json::Value::Null)).is_err());
    }

    #[test]
    fn test_parse_node_ipv4() {
        let mut spec = NodeSpec::default();
        assert!(parse_node_ipv4(&spec).is_err());

        spec.ipv4_address = Some("10.0.0.1".to_string());
        assert_eq!(parse_node_ipv4(&spec).unwrap(), Ipv4Addr::new(10, 0, 0, 1));

        spec.ipv4_address = Some("not-an-ip/24".to_string());
        assert!(parse_node_ipv4(&spec).is_err());
    }

    #[test]
    fn test_valid_node_becomes_host_ip() {
        let spec = NodeSpec {
            ipv4_address: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        let out = normalize_update(node_update("foobar", ResourceValue::Node(spec))).unwrap();

        assert_eq!(out.kv.key, ResourceKey::host_ip("foobar"));
        assert_eq!(
            out.kv.value,
            Some(ResourceValue::HostIp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))))
        );
        assert_eq!(out.kv.revision, "1234");
        assert_eq!(out.update_type, UpdateType::New);
    }

    #[test]
    fn test_bad_node_becomes_deletion() {
        let out = normalize_update(node_update("foobar", "bazzbiff".into())).unwrap();
        assert_eq!(out.kv.key, ResourceKey::host_ip("foobar"));
        assert!(out.kv.value.is_none());
        assert_eq!(out.update_type, UpdateType::Deleted);
    }

    #[test]
    fn test_invalid_value_becomes_deletion() {
        let update = Update::new(ResourceKey::host_ip("h1"), "garbage".into(), "7");
        let out = normalize_update(update).unwrap();
        assert_eq!(out.kv.key, ResourceKey::host_ip("h1"));
        assert_eq!(out.update_type, UpdateType::Deleted);
        assert_eq!(out.kv.revision, "7");
    }

    #[test]
    fn test_updated_without_value_becomes_deletion() {
        let update = Update {
            kv: KvPair::new(ResourceKey::global_config("foobar2"), None, "1238"),
            update_type: UpdateType::Updated,
        };
        let out = normalize_update(update).unwrap();
        assert_eq!(out.update_type, UpdateType::Deleted);
    }

    #[test]
    fn test_invalid_key_is_dropped() {
        let update = Update::new(ResourceKey::global_config("a/b"), "x".into(), "1");
        assert!(normalize_update(update).is_none());
    }

    #[test]
    fn test_filter_preserves_order_and_forwards_status() {
        let recorder = Arc::new(StateRecorder::with_history());
        let filter = ValidationFilter::new(recorder.clone());

        filter.on_status_updated(SyncStatus::ResyncInProgress);
        filter.on_updates(vec![
            Update::new(ResourceKey::global_config("b"), "2".into(), "1"),
            Update::new(ResourceKey::global_config("a/bad"), "x".into(), "2"),
            Update::new(ResourceKey::global_config("a"), "1".into(), "3"),
        ]);
        filter.on_status_updated(SyncStatus::InSync);

        let batches = recorder.batches();
        assert_eq!(batches.len(), 1);
        let paths: Vec<String> = batches[0]
            .iter()
            .map(|u| u.kv.key.default_path().unwrap())
            .collect();
        assert_eq!(paths, vec!["/calico/v1/config/b", "/calico/v1/config/a"]);
        assert_eq!(recorder.status(), Some(SyncStatus::InSync));
    }
}
