use super::backend::{CacheBackend, LedgerOp, SortedSetBackend};
use crate::error::{ForumError, ForumResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// In-process stand-in for Redis with failure injection
#[derive(Default)]
pub(crate) struct MemoryBackend {
    values: Mutex<HashMap<String, (String, Instant)>>,
    zsets: Mutex<HashMap<String, HashMap<String, f64>>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    /// Expiry of derived sorted sets
    zset_expiry: Mutex<HashMap<String, Instant>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call fails while set
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of SET commands applied, lock keys included
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.values
            .lock()
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone())
    }

    pub(crate) fn set_members(&self, key: &str) -> HashSet<String> {
        self.sets.lock().get(key).cloned().unwrap_or_default()
    }

    fn check(&self) -> ForumResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ForumError::RedisError("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn put(&self, key: String, value: String, ttl: Duration) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.values.lock().insert(key, (value, Instant::now() + ttl));
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> ForumResult<Option<String>> {
        self.check()?;
        Ok(self.raw(key))
    }

    async fn mget(&self, keys: &[String]) -> ForumResult<Vec<Option<String>>> {
        self.check()?;
        Ok(keys.iter().map(|key| self.raw(key)).collect())
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> ForumResult<()> {
        self.check()?;
        self.put(key.to_string(), value, ttl);
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, String)>, ttl: Duration) -> ForumResult<()> {
        self.check()?;
        for (key, value) in entries {
            self.put(key, value, ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> ForumResult<()> {
        self.check()?;
        self.values.lock().remove(key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> ForumResult<bool> {
        self.check()?;
        if self.raw(key).is_some() {
            return Ok(false);
        }
        self.put(key.to_string(), value.to_string(), ttl);
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> ForumResult<bool> {
        self.check()?;
        if self.raw(key).as_deref() == Some(expected) {
            self.values.lock().remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn ping(&self) -> ForumResult<()> {
        self.check()
    }
}

#[async_trait]
impl SortedSetBackend for MemoryBackend {
    async fn zscore(&self, key: &str, member: &str) -> ForumResult<Option<f64>> {
        self.check()?;
        Ok(self.zsets.lock().get(key).and_then(|set| set.get(member).copied()))
    }

    async fn zmscore(&self, key: &str, members: &[String]) -> ForumResult<Vec<Option<f64>>> {
        self.check()?;
        let zsets = self.zsets.lock();
        let set = zsets.get(key);
        Ok(members
            .iter()
            .map(|member| set.and_then(|set| set.get(member).copied()))
            .collect())
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> ForumResult<Vec<String>> {
        self.check()?;
        let zsets = self.zsets.lock();
        let Some(set) = zsets.get(key) else {
            return Ok(Vec::new());
        };

        let mut members: Vec<(&String, f64)> = set.iter().map(|(member, score)| (member, *score)).collect();
        members.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| b.0.cmp(a.0))
        });

        let len = members.len() as i64;
        let resolve = |index: i64| if index < 0 { len + index } else { index };
        let (from, to) = (resolve(start).max(0), resolve(stop).min(len - 1));
        if from > to {
            return Ok(Vec::new());
        }
        Ok(members[from as usize..=to as usize]
            .iter()
            .map(|(member, _)| (*member).clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> ForumResult<bool> {
        self.check()?;
        if self.raw(key).is_some() {
            return Ok(true);
        }
        let live = self
            .zset_expiry
            .lock()
            .get(key)
            .map_or(true, |expires_at| *expires_at > Instant::now());
        Ok(live && (self.zsets.lock().contains_key(key) || self.sets.lock().contains_key(key)))
    }

    async fn intersect_into(&self, dest: &str, zset_key: &str, set_key: &str, ttl: Duration) -> ForumResult<()> {
        self.check()?;
        let members = self.set_members(set_key);
        let mut zsets = self.zsets.lock();
        let intersection: HashMap<String, f64> = zsets
            .get(zset_key)
            .map(|scores| {
                scores
                    .iter()
                    .filter(|(member, _)| members.contains(*member))
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        // an empty result leaves no key behind
        if intersection.is_empty() {
            zsets.remove(dest);
        } else {
            zsets.insert(dest.to_string(), intersection);
        }
        self.zset_expiry.lock().insert(dest.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn exec_atomic(&self, ops: Vec<LedgerOp>) -> ForumResult<()> {
        self.check()?;
        let mut zsets = self.zsets.lock();
        let mut sets = self.sets.lock();
        for op in ops {
            match op {
                LedgerOp::IncrementScore { key, member, delta } => {
                    *zsets.entry(key).or_default().entry(member).or_insert(0.0) += delta;
                }
                LedgerOp::SetScore { key, member, score } => {
                    zsets.entry(key).or_default().insert(member, score);
                }
                LedgerOp::RemoveMember { key, member } => {
                    if let Some(set) = zsets.get_mut(&key) {
                        set.remove(&member);
                    }
                }
                LedgerOp::AddToSet { key, member } => {
                    sets.entry(key).or_default().insert(member);
                }
            }
        }
        Ok(())
    }
}
