use crate::error::{ForumError, ForumResult};
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of one cache read
#[derive(Debug)]
pub enum CacheLookup<T> {
    Hit(T),
    Miss,
    /// Backend or payload failure; callers treat it as a miss
    Error(ForumError),
}

impl<T> CacheLookup<T> {
    pub fn outcome_label(&self) -> &'static str {
        match self {
            CacheLookup::Hit(_) => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Error(_) => "error",
        }
    }
}

/// Key-value operations the cache-aside layer and stampede lock need
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> ForumResult<Option<String>>;

    /// One round trip; the result has one slot per key
    async fn mget(&self, keys: &[String]) -> ForumResult<Vec<Option<String>>>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> ForumResult<()>;

    /// Independent SETs sent together for transport efficiency, not atomically
    async fn set_many(&self, entries: Vec<(String, String)>, ttl: Duration) -> ForumResult<()>;

    async fn del(&self, key: &str) -> ForumResult<()>;

    /// Set only when absent; `true` when this call created the key
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> ForumResult<bool>;

    /// Delete `key` only while it still holds `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> ForumResult<bool>;

    async fn ping(&self) -> ForumResult<()>;
}

/// One step of an atomic ledger update
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOp {
    /// ZINCRBY
    IncrementScore { key: String, member: String, delta: f64 },
    /// ZADD
    SetScore { key: String, member: String, score: f64 },
    /// ZREM
    RemoveMember { key: String, member: String },
    /// SADD
    AddToSet { key: String, member: String },
}

/// Sorted-set operations behind the vote ledger
#[async_trait]
pub trait SortedSetBackend: Send + Sync {
    async fn zscore(&self, key: &str, member: &str) -> ForumResult<Option<f64>>;

    async fn zmscore(&self, key: &str, members: &[String]) -> ForumResult<Vec<Option<f64>>>;

    /// Members by descending score, `start..=stop` inclusive
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> ForumResult<Vec<String>>;

    async fn exists(&self, key: &str) -> ForumResult<bool>;

    /// Store at `dest` the members of `set_key` scored as in `zset_key`, expiring after `ttl`
    async fn intersect_into(&self, dest: &str, zset_key: &str, set_key: &str, ttl: Duration) -> ForumResult<()>;

    /// Apply every op or none
    async fn exec_atomic(&self, ops: Vec<LedgerOp>) -> ForumResult<()>;
}
