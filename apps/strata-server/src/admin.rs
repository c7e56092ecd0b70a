//! # Admin Endpoint
//!
//! Small HTTP surface next to the sync port.
//!
//! ```text
//! GET /metrics    → OpenMetrics text for cache + server
//! GET /readiness  → 200 once the cache reports in-sync, 503 before
//! ```

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use strata_core::SyncStatus;
use strata_sync::{AdminSettings, Finished, SnapshotCache};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// State shared by the admin handlers.
pub struct AdminState {
    pub registry: Registry,
    pub cache: Arc<SnapshotCache>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/readiness", get(readiness_handler))
        .with_state(state)
}

/// Binds the admin listener and serves until `cancel` fires.
pub async fn serve(
    settings: &AdminSettings,
    state: Arc<AdminState>,
    cancel: CancellationToken,
) -> anyhow::Result<Finished> {
    let bind_addr = settings.bind_address();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind admin endpoint to {bind_addr}"))?;
    info!(addr = %bind_addr, "Admin endpoint started");

    let (finished, guard) = Finished::new();
    let app = router(state);
    tokio::spawn(async move {
        let _guard = guard;
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;
        if let Err(e) = result {
            warn!(?e, "Admin endpoint stopped with an error");
        }
    });

    Ok(finished)
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(?e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn readiness_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.cache.current_breadcrumb().status {
        SyncStatus::InSync => (StatusCode::OK, "ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::SyncerCallbacks;
    use strata_sync::CacheConfig;

    fn state() -> Arc<AdminState> {
        let cache = Arc::new(SnapshotCache::new(CacheConfig::default()));
        let mut registry = Registry::default();
        cache.metrics().register(&mut registry);
        Arc::new(AdminState { registry, cache })
    }

    #[tokio::test]
    async fn test_readiness_follows_cache_status() {
        let state = state();

        let response = readiness_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.cache.on_status_updated(SyncStatus::InSync);
        let response = readiness_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_are_encoded() {
        let state = state();
        state.cache.on_status_updated(SyncStatus::ResyncInProgress);

        let response = metrics_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            OPENMETRICS_CONTENT_TYPE
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("strata_breadcrumb_seq_number 1"));
        assert!(text.ends_with("# EOF\n"));
    }
}
