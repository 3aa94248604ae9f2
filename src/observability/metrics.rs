use prometheus::{
    Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use crate::database::PoolStats;
use crate::error::{ForumError, ForumResult};

/// Prometheus collectors for the data-access layer
#[derive(Clone)]
pub struct ForumMetrics {
    registry: Arc<Registry>,
    /// Cache lookups by entity and outcome (hit, miss, error)
    pub cache_lookups_total: IntCounterVec,
    /// Fetches that reached the origin, by entity
    pub origin_fetches_total: IntCounterVec,
    /// Background cache populations by entity and outcome
    pub cache_writebacks_total: IntCounterVec,
    /// Times a caller found the stampede lock held
    pub lock_contention_total: IntCounterVec,
    /// Vote submissions by outcome
    pub votes_total: IntCounterVec,
    /// Connection counts by state (open, in_use, idle, max)
    pub pool_connections: IntGaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> ForumResult<IntCounterVec> {
    let collector = IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| ForumError::Internal(format!("Failed to create {} metric: {}", name, e)))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| ForumError::Internal(format!("Failed to register {} metric: {}", name, e)))?;
    Ok(collector)
}

impl ForumMetrics {
    /// Create a registry with all collectors registered
    pub fn new() -> ForumResult<Self> {
        let registry = Registry::new();

        let cache_lookups_total = counter(
            &registry,
            "forum_cache_lookups_total",
            "Cache lookups by entity and outcome",
            &["entity", "outcome"],
        )?;
        let origin_fetches_total = counter(
            &registry,
            "forum_origin_fetches_total",
            "Fetches that reached the relational store",
            &["entity"],
        )?;
        let cache_writebacks_total = counter(
            &registry,
            "forum_cache_writebacks_total",
            "Background cache populations",
            &["entity", "outcome"],
        )?;
        let lock_contention_total = counter(
            &registry,
            "forum_lock_contention_total",
            "Cache misses that found the stampede lock held",
            &["entity"],
        )?;
        let votes_total = counter(
            &registry,
            "forum_votes_total",
            "Vote submissions by outcome",
            &["outcome"],
        )?;

        let pool_connections = IntGaugeVec::new(
            Opts::new("forum_pool_connections", "Database pool connections by state"),
            &["state"],
        )
        .map_err(|e| ForumError::Internal(format!("Failed to create forum_pool_connections metric: {}", e)))?;
        registry
            .register(Box::new(pool_connections.clone()))
            .map_err(|e| ForumError::Internal(format!("Failed to register forum_pool_connections metric: {}", e)))?;

        Ok(Self {
            registry: Arc::new(registry),
            cache_lookups_total,
            origin_fetches_total,
            cache_writebacks_total,
            lock_contention_total,
            votes_total,
            pool_connections,
        })
    }

    pub fn observe_pool(&self, stats: &PoolStats) {
        self.pool_connections.with_label_values(&["open"]).set(stats.open_connections as i64);
        self.pool_connections.with_label_values(&["in_use"]).set(stats.in_use as i64);
        self.pool_connections.with_label_values(&["idle"]).set(stats.idle as i64);
        self.pool_connections.with_label_values(&["max"]).set(stats.max_open_connections as i64);
    }

    /// Get metrics in Prometheus text format
    pub fn gather(&self) -> ForumResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)
            .map_err(|e| ForumError::Internal(format!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer)
            .map_err(|e| ForumError::Internal(format!("Failed to convert metrics to string: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = ForumMetrics::new().unwrap();
        let b = ForumMetrics::new().unwrap();

        a.votes_total.with_label_values(&["accepted"]).inc();

        assert_eq!(a.votes_total.with_label_values(&["accepted"]).get(), 1);
        assert_eq!(b.votes_total.with_label_values(&["accepted"]).get(), 0);
    }

    #[test]
    fn test_gather_renders_text_format() {
        let metrics = ForumMetrics::new().unwrap();
        metrics.cache_lookups_total.with_label_values(&["post", "hit"]).inc_by(3);

        let rendered = metrics.gather().unwrap();
        assert!(rendered.contains("forum_cache_lookups_total"));
        assert!(rendered.contains("outcome=\"hit\""));
    }

    #[test]
    fn test_observe_pool_sets_gauges() {
        let metrics = ForumMetrics::new().unwrap();
        let stats = PoolStats {
            max_open_connections: 20,
            open_connections: 8,
            in_use: 5,
            idle: 3,
            ..Default::default()
        };

        metrics.observe_pool(&stats);

        assert_eq!(metrics.pool_connections.with_label_values(&["in_use"]).get(), 5);
        assert_eq!(metrics.pool_connections.with_label_values(&["max"]).get(), 20);
    }
}
