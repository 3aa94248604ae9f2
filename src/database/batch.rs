use crate::error::{ForumError, ForumResult};
use crate::types::Entity;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Origin able to resolve many ids with one set-membership query
#[async_trait]
pub trait BatchSource<T>: Send + Sync {
    async fn query_by_ids(&self, ids: &[i64]) -> ForumResult<Vec<T>>;
}

/// Rows keyed by id plus the requested ids that produced no row
#[derive(Debug)]
pub struct BatchResult<T> {
    pub rows: HashMap<i64, T>,
    pub missing: Vec<i64>,
}

impl<T> BatchResult<T> {
    pub fn empty() -> Self {
        Self {
            rows: HashMap::new(),
            missing: Vec::new(),
        }
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }
}

/// Collapses per-item lookups into one bounded IN query
#[derive(Debug, Clone, Copy)]
pub struct BatchFetcher {
    max_batch_size: usize,
}

impl BatchFetcher {
    pub fn new(max_batch_size: usize) -> Self {
        Self { max_batch_size }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Unique ids in first-seen order
    pub fn dedup(ids: &[i64]) -> Vec<i64> {
        let mut seen = HashSet::with_capacity(ids.len());
        ids.iter().copied().filter(|id| seen.insert(*id)).collect()
    }

    /// Resolve `ids` against `source` with a single query.
    ///
    /// More unique ids than the configured maximum is a caller error. Ids
    /// without a row are reported in `missing`, not as a failure.
    pub async fn fetch<T, S>(&self, source: &S, ids: &[i64]) -> ForumResult<BatchResult<T>>
    where
        T: Entity + Send,
        S: BatchSource<T> + ?Sized,
    {
        let unique = Self::dedup(ids);
        if unique.is_empty() {
            return Ok(BatchResult::empty());
        }
        if unique.len() > self.max_batch_size {
            return Err(ForumError::InvalidRequest(format!(
                "Batch of {} unique ids exceeds maximum of {}",
                unique.len(),
                self.max_batch_size
            )));
        }

        let fetched = source.query_by_ids(&unique).await?;

        let mut rows: HashMap<i64, T> = HashMap::with_capacity(fetched.len());
        for row in fetched {
            rows.insert(row.entity_id(), row);
        }

        let missing: Vec<i64> = unique.iter().copied().filter(|id| !rows.contains_key(id)).collect();
        if !missing.is_empty() {
            warn!(
                entity = T::KIND,
                requested = unique.len(),
                found = rows.len(),
                missing = missing.len(),
                "Batch fetch returned fewer rows than requested"
            );
        } else {
            debug!(entity = T::KIND, count = rows.len(), "Batch fetch complete");
        }

        Ok(BatchResult { rows, missing })
    }
}
