use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Failure talking to the backing store.
///
/// Every variant means the store is unavailable for this operation. Callers
/// must keep this apart from a legitimate miss (`Ok(None)`).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {op} timed out")]
    Timeout { op: &'static str },
    #[error("store unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: protocol error: {0}")]
    Protocol(String),
    #[error("store unavailable: unexpected reply to {op}")]
    UnexpectedReply { op: &'static str },
    #[error("store unavailable: client is closed")]
    Closed,
}

/// Networked key-value store with store-enforced expiry.
///
/// Implementations: [`crate::memory::MemoryStore`] in-process, and the RESP
/// client pool in the server crate. All methods take `&self`; an
/// implementation is shared across request tasks behind an `Arc`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a live value. `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Write a value that expires after `ttl`, overwriting any previous value.
    async fn set_with_expiry(&self, key: &str, value: Bytes, ttl: Duration)
        -> Result<(), StoreError>;

    /// Write only when no live value exists. Returns `true` if written.
    ///
    /// The default is a plain get-then-set: two callers racing on the same
    /// key can both observe the miss and both return `true`. Backends with a
    /// conditional set override this.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.set_with_expiry(key, value, ttl).await?;
        Ok(true)
    }

    /// Remove a key. Returns `true` if a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Round-trip health check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Whole seconds for a store TTL. Sub-second and zero TTLs round up to one
/// second so an entry is never written without expiry.
pub fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

/// Milliseconds held by the orchestrators' runtime-adjustable TTLs.
pub(crate) fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}
