//! Read-through caching and request idempotency over a shared expiring
//! key-value store.
//!
//! - [`read_through::ReadThroughCache`]: serve repeated reads from the store,
//!   fetch from upstream on miss.
//! - [`guard::IdempotencyGuard`]: admit a mutation once per key and TTL window.
//!
//! Both take an `Arc<dyn KeyValueStore>` built once at startup. Neither keeps
//! request state of its own, so any number of service instances can share a
//! store.

pub mod fingerprint;
pub mod guard;
pub mod memory;
pub mod read_through;
pub mod store;

#[cfg(test)]
mod testing;

use std::time::Duration;

/// Default entry lifetime for cache entries and idempotency markers.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

pub use fingerprint::{canonical_json, fingerprint, Fingerprint};
pub use guard::{
    FailurePolicy, GuardDecision, GuardError, GuardSettings, GuardStats, IdempotencyGuard,
    IdempotencyKey, KeyScope, RejectReason, RequestDescriptor,
};
pub use memory::MemoryStore;
pub use read_through::{
    CacheKey, CacheOutcome, CacheStats, Cacheable, KeyError, Lookup, ReadThroughCache,
};
pub use store::{KeyValueStore, StoreError};
