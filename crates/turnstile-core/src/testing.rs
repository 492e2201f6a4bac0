//! Store doubles shared by the unit tests.

use crate::memory::MemoryStore;
use crate::store::{KeyValueStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Store whose every call fails.
pub struct DownStore;

#[async_trait]
impl KeyValueStore for DownStore {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Err(StoreError::Timeout { op: "GET" })
    }
    async fn set_with_expiry(&self, _: &str, _: Bytes, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::Timeout { op: "SET" })
    }
    async fn set_if_absent(&self, _: &str, _: Bytes, _: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Timeout { op: "SET NX" })
    }
    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Closed)
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Closed)
    }
    fn name(&self) -> &'static str {
        "down"
    }
}

/// Store that reads fine but rejects writes.
pub struct ReadOnlyStore(pub MemoryStore);

#[async_trait]
impl KeyValueStore for ReadOnlyStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.0.get(key).await
    }
    async fn set_with_expiry(&self, _: &str, _: Bytes, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::Protocol("READONLY".into()))
    }
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.0.delete(key).await
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "read-only"
    }
}

/// Store without a conditional set, so the trait's get-then-set fallback runs.
pub struct PlainStore(pub MemoryStore);

#[async_trait]
impl KeyValueStore for PlainStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.0.get(key).await
    }
    async fn set_with_expiry(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.0.set_with_expiry(key, value, ttl).await
    }
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.0.delete(key).await
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "plain"
    }
}

/// Store whose first `n` reads time out. Everything else is served from memory.
pub struct FlakyReadStore {
    inner: MemoryStore,
    failing_reads: AtomicUsize,
}

impl FlakyReadStore {
    pub fn new(n: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_reads: AtomicUsize::new(n),
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyReadStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let fail = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::Timeout { op: "GET" });
        }
        self.inner.get(key).await
    }
    async fn set_with_expiry(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner.set_with_expiry(key, value, ttl).await
    }
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "flaky-read"
    }
}

/// Store whose conditional set reports the key as taken for the first
/// `taken` calls while reads never find it, as if the entry expired in
/// between. Calls are counted.
pub struct VanishingStore {
    taken: usize,
    conditional_sets: AtomicUsize,
    reads: AtomicUsize,
}

impl VanishingStore {
    pub fn new(taken: usize) -> Self {
        Self {
            taken,
            conditional_sets: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn conditional_sets(&self) -> usize {
        self.conditional_sets.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for VanishingStore {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
    async fn set_with_expiry(&self, _: &str, _: Bytes, _: Duration) -> Result<(), StoreError> {
        Ok(())
    }
    async fn set_if_absent(&self, _: &str, _: Bytes, _: Duration) -> Result<bool, StoreError> {
        let call = self.conditional_sets.fetch_add(1, Ordering::SeqCst);
        Ok(call >= self.taken)
    }
    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Ok(false)
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "vanishing"
    }
}
