use crate::api::AppState;
use crate::upstream::HttpUpstream;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use turnstile_core::guard::default_volatile_fields;
use turnstile_core::{FailurePolicy, GuardSettings, KeyScope};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub guard: GuardConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_addr")]
    pub addr: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Expired-entry sweep for the in-process backend.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub key_scope: KeyScope,
    #[serde(default = "default_volatile_fields")]
    pub volatile_fields: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.default_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("cache.default_ttl_seconds must be > 0".into()));
        }
        if self.guard.ttl_seconds == 0 {
            return Err(ConfigError::Invalid("guard.ttl_seconds must be > 0".into()));
        }
        if self.store.pool_size == 0 {
            return Err(ConfigError::Invalid("store.pool_size must be > 0".into()));
        }
        let url = &self.upstream.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "upstream.url must be an http:// or https:// URL, got {url:?}"
            )));
        }
        Ok(())
    }

    /// Apply `PORT` and `DEFAULT_EXPIRATION` on top of the file. Unparseable
    /// values are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    let host = self
                        .server
                        .listen_addr
                        .rsplit_once(':')
                        .map_or("0.0.0.0", |(host, _)| host);
                    self.server.listen_addr = format!("{host}:{port}");
                }
                Err(e) => tracing::warn!(value = %port, error = %e, "ignoring invalid PORT"),
            }
        }

        if let Some(ttl) = lookup("DEFAULT_EXPIRATION") {
            match ttl.parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    self.cache.default_ttl_seconds = secs;
                    self.guard.ttl_seconds = secs;
                }
                _ => tracing::warn!(value = %ttl, "ignoring invalid DEFAULT_EXPIRATION"),
            }
        }
    }

    pub fn guard_settings(&self) -> GuardSettings {
        GuardSettings {
            ttl: Duration::from_secs(self.guard.ttl_seconds),
            failure_policy: self.guard.failure_policy,
            key_scope: self.guard.key_scope,
            volatile_fields: self.guard.volatile_fields.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            addr: default_store_addr(),
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_ttl(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl(),
            failure_policy: FailurePolicy::default(),
            key_scope: KeyScope::default(),
            volatile_fields: default_volatile_fields(),
        }
    }
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - TTLs changed → applied to subsequent writes
/// - Upstream URL changed → swapped atomically
/// - Anything that shapes the store or the guard's keys → WARN, ignored
pub fn diff_and_apply(old: &Config, new: &Config, app: &AppState, upstream: &HttpUpstream) {
    if old.cache.default_ttl_seconds != new.cache.default_ttl_seconds {
        app.cache
            .set_ttl(Duration::from_secs(new.cache.default_ttl_seconds));
        tracing::info!(
            old = old.cache.default_ttl_seconds,
            new = new.cache.default_ttl_seconds,
            "config reloaded: cache TTL changed"
        );
    }

    if old.guard.ttl_seconds != new.guard.ttl_seconds {
        app.guard.set_ttl(Duration::from_secs(new.guard.ttl_seconds));
        tracing::info!(
            old = old.guard.ttl_seconds,
            new = new.guard.ttl_seconds,
            "config reloaded: idempotency TTL changed"
        );
    }

    if old.upstream.url != new.upstream.url {
        upstream.set_base_url(&new.upstream.url);
        tracing::info!(
            old = %old.upstream.url,
            new = %new.upstream.url,
            "config reloaded: upstream URL changed"
        );
    }

    if old.store != new.store {
        tracing::warn!("store settings changed, ignoring. Restart to apply");
    }
    if old.guard.failure_policy != new.guard.failure_policy
        || old.guard.key_scope != new.guard.key_scope
        || old.guard.volatile_fields != new.guard.volatile_fields
    {
        tracing::warn!("idempotency key settings changed, ignoring. Restart to apply");
    }
    if old.server != new.server || old.upstream.timeout_ms != new.upstream.timeout_ms {
        tracing::warn!("listener or upstream timeout changed, ignoring. Restart to apply");
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_upstream_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_store_addr() -> String {
    "127.0.0.1:6379".to_string()
}
fn default_pool_size() -> usize {
    16
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_io_timeout_ms() -> u64 {
    500
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_ttl() -> u64 {
    turnstile_core::DEFAULT_TTL.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use turnstile_core::{IdempotencyGuard, KeyValueStore, MemoryStore, ReadThroughCache};

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.default_ttl_seconds, 3600);
        assert_eq!(config.guard.ttl_seconds, 3600);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.guard.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.guard.key_scope, KeyScope::Payload);
    }

    #[test]
    fn parses_all_sections() {
        let config = Config::parse(
            r#"
            [server]
            listen_addr = "127.0.0.1:8000"

            [upstream]
            url = "http://upstream:3000"
            timeout_ms = 250

            [store]
            backend = "memory"
            pool_size = 4

            [cache]
            default_ttl_seconds = 60

            [guard]
            ttl_seconds = 120
            failure_policy = "fail_open"
            key_scope = "client"
            volatile_fields = ["ts"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:8000");
        assert_eq!(config.server.metrics_addr, "0.0.0.0:9090");
        assert_eq!(config.upstream.timeout_ms, 250);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.pool_size, 4);
        assert_eq!(config.store.addr, "127.0.0.1:6379");

        let settings = config.guard_settings();
        assert_eq!(settings.ttl, Duration::from_secs(120));
        assert_eq!(settings.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(settings.key_scope, KeyScope::Client);
        assert_eq!(settings.volatile_fields, vec!["ts".to_string()]);
    }

    #[test]
    fn rejects_invalid_values() {
        for toml in [
            "[cache]\ndefault_ttl_seconds = 0",
            "[guard]\nttl_seconds = 0",
            "[store]\npool_size = 0",
            "[upstream]\nurl = \"ftp://files.example\"",
            "[upstream]\nurl = \"jsonplaceholder.typicode.com\"",
        ] {
            assert!(
                matches!(Config::parse(toml), Err(ConfigError::Invalid(_))),
                "accepted {toml:?}"
            );
        }
        assert!(matches!(
            Config::parse("[guard]\nfailure_policy = \"sometimes\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn accepts_https_upstream() {
        let config =
            Config::parse("[upstream]\nurl = \"https://jsonplaceholder.typicode.com\"").unwrap();
        assert_eq!(config.upstream.url, "https://jsonplaceholder.typicode.com");
    }

    #[test]
    fn env_overrides_port_and_ttl() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("PORT", "8181"), ("DEFAULT_EXPIRATION", "90")]));
        assert_eq!(config.server.listen_addr, "0.0.0.0:8181");
        assert_eq!(config.cache.default_ttl_seconds, 90);
        assert_eq!(config.guard.ttl_seconds, 90);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("PORT", "http"), ("DEFAULT_EXPIRATION", "0")]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn reload_applies_ttls_and_upstream_url() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let upstream = Arc::new(HttpUpstream::new("http://old:3000", Duration::from_secs(1)));
        let app = AppState {
            cache: ReadThroughCache::new(Arc::clone(&store), Duration::from_secs(3600)),
            guard: IdempotencyGuard::new(Arc::clone(&store), GuardSettings::default()),
            store,
            upstream: upstream.clone(),
            users: crate::users::UserDirectory::new(),
        };

        let old = Config::default();
        let mut new = old.clone();
        new.cache.default_ttl_seconds = 30;
        new.guard.ttl_seconds = 45;
        new.upstream.url = "http://new:3000".into();
        new.guard.key_scope = KeyScope::Client;

        diff_and_apply(&old, &new, &app, &upstream);

        assert_eq!(app.cache.ttl(), Duration::from_secs(30));
        assert_eq!(app.guard.ttl(), Duration::from_secs(45));
        assert_eq!(upstream.base_url().as_str(), "http://new:3000");
        assert_eq!(app.guard.key_scope(), KeyScope::Payload);
    }
}
