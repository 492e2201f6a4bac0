use crate::fingerprint::fingerprint;
use crate::store::{millis, KeyValueStore};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store namespace for read-through entries.
const CACHE_PREFIX: &str = "cache:";

/// Longest accepted cache key, in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// A value the read-through cache can persist.
///
/// Empty payloads are returned to the caller but never written, so the
/// absence of data is not pinned for a whole TTL.
pub trait Cacheable: Serialize + DeserializeOwned {
    fn is_empty_payload(&self) -> bool;
}

impl<T: Serialize + DeserializeOwned> Cacheable for Vec<T> {
    fn is_empty_payload(&self) -> bool {
        self.is_empty()
    }
}

impl Cacheable for Value {
    fn is_empty_payload(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            Value::String(s) => s.is_empty(),
            Value::Bool(_) | Value::Number(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("malformed cache key: empty")]
    Empty,
    #[error("malformed cache key: {len} bytes exceeds {MAX_KEY_LEN}")]
    TooLong { len: usize },
    #[error("malformed cache key: contains whitespace or control characters")]
    InvalidChar,
}

/// Validated cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(KeyError::TooLong { len: key.len() });
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(KeyError::InvalidChar);
        }
        Ok(Self(key))
    }

    /// Key for a query against `resource`: `{resource}:{fingerprint}` over the
    /// parameters sorted by name, so parameter order does not matter.
    pub fn for_query(resource: &str, params: &[(&str, &str)]) -> Result<Self, KeyError> {
        let mut params = params.to_vec();
        params.sort_unstable();
        Self::new(format!("{resource}:{}", fingerprint(&params)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn store_key(&self) -> String {
        format!("{CACHE_PREFIX}{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a read-through value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the store; the fetcher was not called.
    Hit,
    /// Store reachable but had no usable entry; fetched from upstream.
    Miss,
    /// Store read failed; fetched from upstream. A write-back is still attempted.
    Bypass,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "HIT",
            CacheOutcome::Miss => "MISS",
            CacheOutcome::Bypass => "BYPASS",
        }
    }
}

/// A read-through result.
#[derive(Debug, Clone)]
pub struct Lookup<T> {
    pub value: T,
    pub outcome: CacheOutcome,
}

/// Snapshot of read-through counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub writes: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

/// Check the store, fetch from upstream on miss, store non-empty results.
///
/// The store is a performance optimization here, never a correctness
/// dependency: read failures fall through to the fetcher, write failures are
/// logged and dropped, and the fetched value is always returned. Concurrent
/// misses on the same key each call their fetcher; the last write wins.
pub struct ReadThroughCache {
    store: Arc<dyn KeyValueStore>,
    ttl_ms: AtomicU64,
    counters: Counters,
}

impl ReadThroughCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        tracing::info!(
            store = store.name(),
            ttl_ms = millis(ttl),
            "read-through cache initialized"
        );
        Self {
            store,
            ttl_ms: AtomicU64::new(millis(ttl)),
            counters: Counters::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Change the TTL used for subsequent writes. Existing entries keep theirs.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(millis(ttl), Ordering::Relaxed);
    }

    /// Return the cached value for `key`, or call `fetcher` and cache its result.
    ///
    /// Fetcher errors are returned unchanged and nothing is cached for them.
    pub async fn fetch_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
    ) -> Result<Lookup<T>, E>
    where
        T: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let store_key = key.store_key();

        let outcome = match self.store.get(&store_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, "cache HIT");
                    return Ok(Lookup {
                        value,
                        outcome: CacheOutcome::Hit,
                    });
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "cached payload unreadable, refetching");
                    CacheOutcome::Miss
                }
            },
            Ok(None) => CacheOutcome::Miss,
            Err(e) => {
                tracing::warn!(key = %key, op = "get", error = %e, "cache read failed, bypassing store");
                CacheOutcome::Bypass
            }
        };

        match outcome {
            CacheOutcome::Bypass => self.counters.bypasses.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };

        let value = fetcher().await?;

        if value.is_empty_payload() {
            tracing::debug!(key = %key, "cache MISS → upstream returned empty result, not cached");
            return Ok(Lookup { value, outcome });
        }

        self.write(key, &store_key, &value).await;
        Ok(Lookup { value, outcome })
    }

    async fn write<T: Serialize>(&self, key: &CacheKey, store_key: &str, value: &T) {
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to serialize payload, not cached");
                return;
            }
        };

        let ttl = self.ttl();
        match self.store.set_with_expiry(store_key, bytes, ttl).await {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, ttl_ms = millis(ttl), "upstream result cached");
            }
            Err(e) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, op = "set", error = %e, "cache write failed");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }
}
