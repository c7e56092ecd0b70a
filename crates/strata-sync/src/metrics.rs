//! # Metrics
//!
//! Per-instance Prometheus metrics for the cache and the server.
//!
//! Each `SnapshotCache` and `SyncServer` owns its own metric handles, so
//! tests can stand up several independent instances in one process. The
//! binary registers them into one `Registry` under the `strata_` prefix:
//!
//! | Metric                              | Type    | Meaning                              |
//! |-------------------------------------|---------|--------------------------------------|
//! | `strata_connections_active`         | gauge   | accepted and not yet torn down       |
//! | `strata_connections_accepted`       | counter | TCP accepts                          |
//! | `strata_connections_dropped`        | counter | admission-control drops              |
//! | `strata_connections_failed`         | counter | protocol, I/O and heartbeat failures |
//! | `strata_breadcrumb_seq_number`      | gauge   | sequence of the latest breadcrumb    |
//! | `strata_breadcrumb_size`            | gauge   | updates in the latest breadcrumb     |
//! | `strata_snapshot_kvs`               | gauge   | keys in the current snapshot         |
//! | `strata_updates_skipped`            | counter | unserializable or no-op updates      |

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Prefix for every metric registered by this crate.
pub const METRIC_PREFIX: &str = "strata";

// =============================================================================
// Server Metrics
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct ServerMetrics {
    pub connections_active: Gauge,
    pub connections_accepted: Counter,
    pub connections_dropped: Counter,
    pub connections_failed: Counter,
}

impl ServerMetrics {
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix(METRIC_PREFIX);
        registry.register(
            "connections_active",
            "Number of client connections currently open",
            self.connections_active.clone(),
        );
        registry.register(
            "connections_accepted",
            "Total client connections accepted",
            self.connections_accepted.clone(),
        );
        registry.register(
            "connections_dropped",
            "Total client connections closed by admission control",
            self.connections_dropped.clone(),
        );
        registry.register(
            "connections_failed",
            "Total client connections closed by an error or heartbeat timeout",
            self.connections_failed.clone(),
        );
    }
}

// =============================================================================
// Cache Metrics
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    pub breadcrumb_seq_number: Gauge,
    pub breadcrumb_size: Gauge,
    pub snapshot_kvs: Gauge,
    pub updates_skipped: Counter,
}

impl CacheMetrics {
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix(METRIC_PREFIX);
        registry.register(
            "breadcrumb_seq_number",
            "Sequence number of the most recently published breadcrumb",
            self.breadcrumb_seq_number.clone(),
        );
        registry.register(
            "breadcrumb_size",
            "Number of updates in the most recently published breadcrumb",
            self.breadcrumb_size.clone(),
        );
        registry.register(
            "snapshot_kvs",
            "Number of keys in the current snapshot",
            self.snapshot_kvs.clone(),
        );
        registry.register(
            "updates_skipped",
            "Updates ignored by the cache (unserializable keys or no-op deletes)",
            self.updates_skipped.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registered_names_are_prefixed() {
        let mut registry = Registry::default();
        let server = ServerMetrics::default();
        let cache = CacheMetrics::default();
        server.register(&mut registry);
        cache.register(&mut registry);

        server.connections_active.inc();
        cache.breadcrumb_seq_number.set(7);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("strata_connections_active 1"));
        assert!(out.contains("strata_breadcrumb_seq_number 7"));
        assert!(out.contains("strata_connections_dropped_total 0"));
    }
}
