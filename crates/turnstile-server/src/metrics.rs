use crate::api::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use turnstile_core::{CacheStats, GuardStats};

#[derive(Clone)]
pub struct MetricsState {
    pub app: Arc<AppState>,
    pub started: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub ttl_seconds: u64,
}

impl CacheMetrics {
    fn from_stats(stats: CacheStats, ttl_seconds: u64) -> Self {
        let total = stats.hits + stats.misses + stats.bypasses;
        CacheMetrics {
            hit_rate: if total > 0 {
                stats.hits as f64 / total as f64
            } else {
                0.0
            },
            hits: stats.hits,
            misses: stats.misses,
            bypasses: stats.bypasses,
            writes: stats.writes,
            write_failures: stats.write_failures,
            ttl_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardMetrics {
    pub admitted: u64,
    pub duplicates: u64,
    pub token_reuses: u64,
    pub unavailable: u64,
    pub admitted_unguarded: u64,
    pub released: u64,
    pub ttl_seconds: u64,
    pub failure_policy: String,
    pub key_scope: String,
}

impl GuardMetrics {
    fn from_stats(stats: GuardStats, app: &AppState) -> Self {
        GuardMetrics {
            admitted: stats.admitted,
            duplicates: stats.duplicates,
            token_reuses: stats.token_reuses,
            unavailable: stats.unavailable,
            admitted_unguarded: stats.admitted_unguarded,
            released: stats.released,
            ttl_seconds: app.guard.ttl().as_secs(),
            failure_policy: format!("{:?}", app.guard.failure_policy()),
            key_scope: format!("{:?}", app.guard.key_scope()),
        }
    }
}

pub fn router(state: MetricsState, prom_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .with_state(state)
}

/// GET /api/stats: one-shot counters for the cache and the guard.
pub async fn stats_handler(State(state): State<MetricsState>) -> Json<serde_json::Value> {
    let app = &state.app;
    let cache = CacheMetrics::from_stats(app.cache.stats(), app.cache.ttl().as_secs());
    let guard = GuardMetrics::from_stats(app.guard.stats(), app);

    Json(serde_json::json!({
        "store": app.store.name(),
        "uptime_seconds": state.started.elapsed().as_secs(),
        "users": app.users.len(),
        "cache": cache,
        "guard": guard,
    }))
}
