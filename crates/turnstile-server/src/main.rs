mod api;
mod config;
mod metrics;
mod resp;
mod upstream;
mod users;

use api::AppState;
use config::{Config, StoreBackend};
use crate::metrics::MetricsState;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use resp::{RespSettings, RespStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use turnstile_core::{IdempotencyGuard, KeyValueStore, MemoryStore, ReadThroughCache};
use upstream::HttpUpstream;
use users::UserDirectory;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config_path = PathBuf::from("config.toml");
    let mut config = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(c) => {
                tracing::info!("loaded config from config.toml");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load config.toml, using defaults");
                Config::default()
            }
        }
    } else {
        tracing::info!("no config.toml found, using defaults");
        Config::default()
    };
    config.apply_env_overrides(|name| std::env::var(name).ok());

    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    let shutdown = CancellationToken::new();

    let (store, resp_pool) = build_store(&config, shutdown.clone()).await;

    let upstream = Arc::new(HttpUpstream::new(
        &config.upstream.url,
        Duration::from_millis(config.upstream.timeout_ms),
    ));

    let state = Arc::new(AppState {
        cache: ReadThroughCache::new(
            Arc::clone(&store),
            Duration::from_secs(config.cache.default_ttl_seconds),
        ),
        guard: IdempotencyGuard::new(Arc::clone(&store), config.guard_settings()),
        store,
        upstream: upstream.clone(),
        users: UserDirectory::new(),
    });

    let metrics_router = crate::metrics::router(
        MetricsState {
            app: Arc::clone(&state),
            started: Instant::now(),
        },
        prom_handle,
    );
    let api_router = api::router(Arc::clone(&state));

    let api_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        api = %api_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        store = state.store.name(),
        cache_ttl_seconds = config.cache.default_ttl_seconds,
        guard_ttl_seconds = config.guard.ttl_seconds,
        "turnstile starting"
    );

    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind api to {api_addr}: {e}"));

    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind metrics to {metrics_addr}: {e}"));

    spawn_config_watcher(config_path, config, Arc::clone(&state), upstream);

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let api_future = axum::serve(
        api_listener,
        api_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let metrics_future = axum::serve(metrics_listener, metrics_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = api_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "api server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    shutdown.cancel();
    if let Some(pool) = resp_pool {
        pool.close();
    }
    tracing::info!("turnstile shut down");
}

/// Build the shared store. The RESP pool is also returned so it can be
/// closed at shutdown.
async fn build_store(
    config: &Config,
    shutdown: CancellationToken,
) -> (Arc<dyn KeyValueStore>, Option<Arc<RespStore>>) {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            tokio::spawn(sweep_expired(
                Arc::clone(&store),
                Duration::from_secs(config.store.sweep_interval_secs.max(1)),
                shutdown,
            ));
            tracing::warn!("using in-process store: entries are not shared between instances");
            let store: Arc<dyn KeyValueStore> = store;
            (store, None)
        }
        StoreBackend::Redis => {
            let pool = Arc::new(RespStore::new(RespSettings {
                addr: config.store.addr.clone(),
                pool_size: config.store.pool_size,
                connect_timeout: Duration::from_millis(config.store.connect_timeout_ms),
                io_timeout: Duration::from_millis(config.store.io_timeout_ms),
            }));
            // Not fatal: reads bypass and writes follow the failure policy
            // until the store comes back.
            if let Err(e) = pool.ping().await {
                tracing::warn!(addr = %config.store.addr, error = %e, "store not reachable at startup");
            }
            let store: Arc<dyn KeyValueStore> = pool.clone();
            (store, Some(pool))
        }
    }
}

/// Periodically drop expired entries from the in-process store.
async fn sweep_expired(store: Arc<MemoryStore>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = store.len(), "expired entries swept");
                }
            }
        }
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch config.toml and apply safe changes at runtime.
fn spawn_config_watcher(
    config_path: PathBuf,
    initial_config: Config,
    state: Arc<AppState>,
    upstream: Arc<HttpUpstream>,
) {
    let current_config = Arc::new(Mutex::new(initial_config));

    let watched = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                reload(&watched, &current_config, &state, &upstream);
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config.toml");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}

fn reload(path: &Path, current: &Mutex<Config>, state: &AppState, upstream: &HttpUpstream) {
    match Config::load(path) {
        Ok(mut new_config) => {
            new_config.apply_env_overrides(|name| std::env::var(name).ok());
            let mut old = current.lock();
            config::diff_and_apply(&old, &new_config, state, upstream);
            *old = new_config;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to reload config.toml");
        }
    }
}
