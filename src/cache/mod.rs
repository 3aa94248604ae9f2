/// Caching module
///
/// Read-through caching for posts, users and communities on top of Redis:
/// - per-entity cache-aside stores with stampede protection
/// - token-owned distributed locks
/// - pipelined batch population
/// - sorted-set storage for the vote ledger

mod backend;
mod keys;
mod lock;
mod redis_client;
mod store;

#[cfg(test)]
pub(crate) mod memory;


pub use backend::{CacheBackend, CacheLookup, LedgerOp, SortedSetBackend};
pub use keys::KeySpace;
pub use lock::{LockGuard, StampedeLock};
pub use redis_client::RedisBackend;
pub use store::{BatchLoader, CacheAsideStore, CacheStats, Cacheable, EntityLoader, StoreSettings};
