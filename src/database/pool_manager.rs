use crate::config::DatabaseConfig;
use crate::error::{ForumError, ForumResult};
use crate::observability::{sanitize_url_for_logging, ForumMetrics};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Object, Pool, PoolConfig, PoolError, Runtime};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use tracing::{debug, error, info, warn};

/// Share of `max_open_connections` above which the stats ticker warns
const HIGH_UTILIZATION_RATIO: f64 = 0.8;

/// Point-in-time copy of pool and query statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub max_open_connections: u64,
    pub open_connections: u64,
    pub in_use: u64,
    pub idle: u64,

    /// Checkouts that found every connection busy
    pub wait_count: u64,
    pub wait_duration: Duration,

    pub write_query_count: u64,
    pub read_query_count: u64,
    /// reads / (reads + writes)
    pub read_write_ratio: f64,
    pub read_pool_count: usize,

    pub avg_query_time_ms: f64,
    pub slow_query_count: u64,
    pub error_count: u64,

    pub last_update_time: DateTime<Utc>,
}

/// Which pool served a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    Write,
    Read(usize),
}

/// Outcome of [`ConnectionPoolManager::health_check`]
#[derive(Debug)]
pub enum PoolHealth {
    Healthy,
    /// Write pool fine, some read pools failed
    Degraded(Vec<String>),
    Unhealthy(ForumError),
}

impl PoolHealth {
    /// Whether traffic can still be served
    pub fn is_serving(&self) -> bool {
        !matches!(self, PoolHealth::Unhealthy(_))
    }
}

#[derive(Debug, Default)]
struct QueryStats {
    samples: u64,
    avg_query_time_ms: f64,
    slow_query_count: u64,
    error_count: u64,
    wait_count: u64,
    wait_duration: Duration,
}

/// Owns one write pool and any number of read replicas
pub struct ConnectionPoolManager {
    write_pool: Pool,
    /// Selection path lock, never held while touching `stats`
    read_pools: RwLock<Vec<Pool>>,
    next_read: AtomicUsize,
    write_queries: AtomicU64,
    read_queries: AtomicU64,
    stats: Mutex<QueryStats>,
    config: DatabaseConfig,
    initialized: OnceCell<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

fn build_pool(url: &str, config: &DatabaseConfig) -> ForumResult<Pool> {
    let mut pg_config = Config::new();
    pg_config.url = Some(url.to_string());

    let mut pool_config = PoolConfig::new(config.max_connections as usize);
    pool_config.timeouts.wait = Some(config.connection_timeout());
    pool_config.timeouts.create = Some(config.connection_timeout());
    pool_config.timeouts.recycle = Some(config.connection_timeout());
    pg_config.pool = Some(pool_config);

    pg_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| ForumError::DatabaseError(format!("Failed to create connection pool: {}", e)))
}

fn map_pool_error(err: PoolError) -> ForumError {
    match err {
        PoolError::Timeout(_) => ForumError::Timeout,
        other => ForumError::DatabaseError(format!("Failed to get connection: {}", other)),
    }
}

async fn ping(pool: &Pool) -> ForumResult<()> {
    let client = pool.get().await.map_err(map_pool_error)?;
    client
        .execute("SELECT 1", &[])
        .await
        .map_err(|e| ForumError::DatabaseError(format!("Ping failed: {}", e)))?;
    Ok(())
}

async fn ping_until(pool: &Pool, until: tokio::time::Instant) -> ForumResult<()> {
    tokio::time::timeout_at(until, ping(pool))
        .await
        .map_err(|_| ForumError::Timeout)?
}

impl ConnectionPoolManager {
    /// Build the pools without connecting.
    ///
    /// Read pools whose URL cannot be turned into a pool are logged and skipped.
    pub fn new(config: DatabaseConfig) -> ForumResult<Self> {
        info!("Creating write pool for {}", sanitize_url_for_logging(&config.url));
        let write_pool = build_pool(&config.url, &config)?;

        let mut read_pools = Vec::new();
        if config.read_write_split {
            for url in &config.read_urls {
                match build_pool(url, &config) {
                    Ok(pool) => read_pools.push(pool),
                    Err(e) => error!(
                        replica = %sanitize_url_for_logging(url),
                        "Skipping read replica: {}", e
                    ),
                }
            }
        }

        Ok(Self::from_pools(config, write_pool, read_pools))
    }

    pub fn from_pools(config: DatabaseConfig, write_pool: Pool, read_pools: Vec<Pool>) -> Self {
        Self {
            write_pool,
            read_pools: RwLock::new(read_pools),
            next_read: AtomicUsize::new(0),
            write_queries: AtomicU64::new(0),
            read_queries: AtomicU64::new(0),
            stats: Mutex::new(QueryStats::default()),
            config,
            initialized: OnceCell::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Create the pools and verify connectivity
    pub async fn connect(config: DatabaseConfig) -> ForumResult<Arc<Self>> {
        let manager = Arc::new(Self::new(config)?);
        manager.init().await?;
        Ok(manager)
    }

    /// Verify connectivity once; later calls are no-ops.
    ///
    /// The write pool must answer. Read pools that do not are dropped, and
    /// with none left the manager runs in single-pool mode.
    pub async fn init(&self) -> ForumResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                let until = tokio::time::Instant::now() + self.config.connection_timeout();

                ping_until(&self.write_pool, until).await.map_err(|e| {
                    ForumError::DatabaseError(format!("Write pool initialization failed: {}", e))
                })?;

                let candidates = self.read_pools.read().clone();
                if !candidates.is_empty() {
                    let results =
                        futures::future::join_all(candidates.iter().map(|pool| ping_until(pool, until))).await;

                    let healthy: Vec<Pool> = candidates
                        .into_iter()
                        .zip(results)
                        .enumerate()
                        .filter_map(|(index, (pool, result))| match result {
                            Ok(()) => Some(pool),
                            Err(e) => {
                                error!(index, "Read pool failed initialization: {}", e);
                                None
                            }
                        })
                        .collect();

                    if healthy.is_empty() {
                        error!("All read pools failed, degrading to single-pool mode");
                    }
                    *self.read_pools.write() = healthy;
                }

                info!(
                    max_connections = self.config.max_connections,
                    read_write_split = self.config.read_write_split,
                    read_pool_count = self.read_pool_count(),
                    "Connection pools initialized"
                );
                Ok::<(), ForumError>(())
            })
            .await
            .map(|_| ())
    }

    pub fn read_pool_count(&self) -> usize {
        self.read_pools.read().len()
    }

    /// The single write-capable pool
    pub fn write_handle(&self) -> Pool {
        self.write_queries.fetch_add(1, Ordering::Relaxed);
        self.write_pool.clone()
    }

    /// A read pool chosen round-robin, or the write pool when there is none
    pub fn read_handle(&self) -> Pool {
        self.read_queries.fetch_add(1, Ordering::Relaxed);
        self.select_read().1
    }

    pub(crate) fn select_read(&self) -> (PoolRole, Pool) {
        let pools = self.read_pools.read();
        if pools.is_empty() {
            return (PoolRole::Write, self.write_pool.clone());
        }
        let index = self.next_read.fetch_add(1, Ordering::Relaxed) % pools.len();
        (PoolRole::Read(index), pools[index].clone())
    }

    /// Check out a connection from the write pool
    pub async fn write_connection(&self) -> ForumResult<Object> {
        let pool = self.write_handle();
        self.checkout(&pool).await
    }

    /// Check out a connection from a read pool
    pub async fn read_connection(&self) -> ForumResult<Object> {
        let pool = self.read_handle();
        self.checkout(&pool).await
    }

    async fn checkout(&self, pool: &Pool) -> ForumResult<Object> {
        let status = pool.status();
        let must_wait = status.available as u64 == 0 && status.size as u64 >= status.max_size as u64;

        let start = Instant::now();
        let result = pool.get().await;

        if must_wait {
            let waited = start.elapsed();
            let mut stats = self.stats.lock();
            stats.wait_count += 1;
            stats.wait_duration += waited;
        }

        result.map_err(map_pool_error)
    }

    /// Run one origin query under the configured deadline and record its outcome
    pub async fn timed<T, F>(&self, query: F) -> ForumResult<T>
    where
        F: Future<Output = ForumResult<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.config.query_timeout(), query).await {
            Ok(result) => result,
            Err(_) => Err(ForumError::Timeout),
        };
        self.record_query_outcome(start.elapsed(), result.is_err());
        result
    }

    /// Fold one query into the latency mean and the slow/error counters
    pub fn record_query_outcome(&self, duration: Duration, is_error: bool) {
        let duration_ms = duration.as_secs_f64() * 1000.0;

        let mut stats = self.stats.lock();
        stats.samples += 1;
        stats.avg_query_time_ms += (duration_ms - stats.avg_query_time_ms) / stats.samples as f64;

        if duration > self.config.slow_query_threshold() {
            stats.slow_query_count += 1;
            debug!(duration_ms, "Slow query recorded");
        }
        if is_error {
            stats.error_count += 1;
        }
    }

    /// Copy of the current statistics
    pub fn snapshot(&self) -> PoolStats {
        let mut snapshot = PoolStats::default();

        let read_pools = self.read_pools.read().clone();
        for pool in std::iter::once(&self.write_pool).chain(read_pools.iter()) {
            let status = pool.status();
            let size = status.size as u64;
            let available = status.available as u64;
            snapshot.max_open_connections += status.max_size as u64;
            snapshot.open_connections += size;
            snapshot.idle += available;
            snapshot.in_use += size.saturating_sub(available);
        }
        snapshot.read_pool_count = read_pools.len();

        snapshot.write_query_count = self.write_queries.load(Ordering::Relaxed);
        snapshot.read_query_count = self.read_queries.load(Ordering::Relaxed);
        let total = snapshot.write_query_count + snapshot.read_query_count;
        if total > 0 {
            snapshot.read_write_ratio = snapshot.read_query_count as f64 / total as f64;
        }

        {
            let stats = self.stats.lock();
            snapshot.wait_count = stats.wait_count;
            snapshot.wait_duration = stats.wait_duration;
            snapshot.avg_query_time_ms = stats.avg_query_time_ms;
            snapshot.slow_query_count = stats.slow_query_count;
            snapshot.error_count = stats.error_count;
        }

        snapshot.last_update_time = Utc::now();
        snapshot
    }

    /// Ping the write pool (fatal) and every read pool (degrading) before `deadline` elapses
    pub async fn health_check(&self, deadline: Duration) -> PoolHealth {
        let until = tokio::time::Instant::now() + deadline;

        let write = ping_until(&self.write_pool, until).await;
        if let Err(e) = &write {
            error!("Write pool health check failed: {}", e);
        }

        let read_pools = self.read_pools.read().clone();
        let reads = futures::future::join_all(read_pools.iter().map(|pool| ping_until(pool, until))).await;

        classify_health(write, reads)
    }

    /// Periodically log pool pressure and refresh pool gauges
    pub fn spawn_stats_monitor(self: &Arc<Self>, metrics: Option<ForumMetrics>) {
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.stats_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                let stats = manager.snapshot();
                if let Some(metrics) = &metrics {
                    metrics.observe_pool(&stats);
                }
                for warning in utilization_warnings(&stats) {
                    warn!(
                        open_connections = stats.open_connections,
                        max_open_connections = stats.max_open_connections,
                        wait_count = stats.wait_count,
                        "{}", warning
                    );
                }
            }
        });

        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the monitor and close every pool, reporting all failures together
    pub fn close(&self) -> ForumResult<()> {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }

        let mut errors = Vec::new();

        if self.write_pool.is_closed() {
            errors.push("write pool already closed".to_string());
        } else {
            self.write_pool.close();
        }

        for (index, pool) in self.read_pools.read().iter().enumerate() {
            if pool.is_closed() {
                errors.push(format!("read pool {} already closed", index));
            } else {
                pool.close();
            }
        }

        if errors.is_empty() {
            info!("Connection pools closed");
            Ok(())
        } else {
            Err(ForumError::DatabaseError(format!(
                "Errors while closing pools: {}",
                errors.join("; ")
            )))
        }
    }
}

/// Combine ping results into an overall health verdict
pub(crate) fn classify_health(write: ForumResult<()>, reads: Vec<ForumResult<()>>) -> PoolHealth {
    if let Err(e) = write {
        return PoolHealth::Unhealthy(e);
    }

    let warnings: Vec<String> = reads
        .into_iter()
        .enumerate()
        .filter_map(|(index, result)| {
            result.err().map(|e| {
                error!(index, "Read pool health check failed: {}", e);
                format!("read pool {}: {}", index, e)
            })
        })
        .collect();

    if warnings.is_empty() {
        PoolHealth::Healthy
    } else {
        PoolHealth::Degraded(warnings)
    }
}

/// Warnings the stats ticker should log for this snapshot
pub(crate) fn utilization_warnings(stats: &PoolStats) -> Vec<String> {
    let mut warnings = Vec::new();

    if stats.max_open_connections > 0 {
        let usage = stats.open_connections as f64 / stats.max_open_connections as f64;
        if usage > HIGH_UTILIZATION_RATIO {
            warnings.push(format!("Connection pool utilization high: {:.0}%", usage * 100.0));
        }
    }

    if stats.wait_count > 0 {
        warnings.push(format!(
            "Connection pool waits observed: {} waits, {:?} total",
            stats.wait_count, stats.wait_duration
        ));
    }

    warnings
}
