use super::backend::CacheBackend;
use crate::error::ForumResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// TTL-bounded mutual exclusion on the shared cache.
///
/// Each holder writes a fresh token and only deletes the key while it still
/// holds that token, so an expired holder cannot release a successor's lock.
#[derive(Clone)]
pub struct StampedeLock {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

/// Held lock; released explicitly or in the background on drop
pub struct LockGuard {
    backend: Arc<dyn CacheBackend>,
    key: String,
    token: String,
    released: bool,
}

impl StampedeLock {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// `None` when another holder has the key
    pub async fn try_acquire(&self, key: String) -> ForumResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        if self.backend.set_nx(&key, &token, self.ttl).await? {
            debug!(key = %key, "Stampede lock acquired");
            Ok(Some(LockGuard {
                backend: Arc::clone(&self.backend),
                key,
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `false` when the lock had already expired or changed hands
    pub async fn release(mut self) -> ForumResult<bool> {
        self.released = true;
        let released = self.backend.delete_if_equals(&self.key, &self.token).await?;
        if !released {
            warn!(key = %self.key, "Stampede lock expired before release");
        }
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // expires on its own
            return;
        };
        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = backend.delete_if_equals(&key, &token).await {
                warn!(key = %key, "Failed to release stampede lock: {}", e);
            }
        });
    }
}
