use crate::store::{ttl_seconds, KeyValueStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

/// A stored value and its expiry.
#[derive(Clone, Debug)]
struct Entry {
    value: Bytes,
    inserted_at: Instant,
    ttl: Duration,
}

impl Entry {
    /// Expiry is kept in whole seconds, rounded up, as a RESP `EX` would.
    fn new(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl: Duration::from_secs(ttl_seconds(ttl)),
        }
    }

    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

type Shard = HashMap<String, Entry>;

/// In-process expiring key-value store.
///
/// Distributes keys across 64 independent shards, each behind its own
/// `RwLock`, so unrelated keys never contend. Reads of live entries take a
/// read lock; writes, conditional writes and lazy removal of expired entries
/// take a write lock on one shard only. A conditional write checks and
/// inserts under the same write lock, so `set_if_absent` is atomic.
///
/// Expiry is measured with `tokio::time::Instant`, which follows a paused
/// test clock.
pub struct MemoryStore {
    shards: Box<[RwLock<Shard>; NUM_SHARDS]>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let shards: Vec<RwLock<Shard>> = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        let shards: Box<[RwLock<Shard>; NUM_SHARDS]> = shards
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!());

        Self { shards }
    }

    /// Hash a key and return the shard index.
    #[inline]
    fn shard_index(key: &str) -> usize {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        (hash & SHARD_MASK) as usize
    }

    fn shard(&self, key: &str) -> &RwLock<Shard> {
        &self.shards[Self::shard_index(key)]
    }

    /// Number of live entries across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().filter(|e| !e.is_expired()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let before = shard.len();
            shard.retain(|_, entry| !entry.is_expired());
            removed += before - shard.len();
        }
        removed
    }

    fn get_sync(&self, key: &str) -> Option<Bytes> {
        let shard = self.shard(key);
        {
            let guard = shard.read();
            match guard.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: remove unless someone rewrote it since we looked.
        let mut guard = shard.write();
        if guard.get(key).is_some_and(Entry::is_expired) {
            guard.remove(key);
        }
        None
    }

    fn set_sync(&self, key: &str, value: Bytes, ttl: Duration) {
        self.shard(key)
            .write()
            .insert(key.to_string(), Entry::new(value, ttl));
    }

    fn set_if_absent_sync(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        let mut guard = self.shard(key).write();
        if guard.get(key).is_some_and(|e| !e.is_expired()) {
            return false;
        }
        guard.insert(key.to_string(), Entry::new(value, ttl));
        true
    }

    fn delete_sync(&self, key: &str) -> bool {
        self.shard(key)
            .write()
            .remove(key)
            .is_some_and(|e| !e.is_expired())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.get_sync(key))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.set_sync(key, value, ttl);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.set_if_absent_sync(key, value, ttl))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.delete_sync(key))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
