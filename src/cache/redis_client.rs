use super::backend::{CacheBackend, LedgerOp, SortedSetBackend};
use crate::config::RedisConfig;
use crate::error::{ForumError, ForumResult};
use crate::observability::sanitize_url_for_logging;
use async_trait::async_trait;
use fred::{
    clients::RedisPool,
    interfaces::{
        ClientLike, KeysInterface, LuaInterface, SetsInterface, SortedSetsInterface, TransactionInterface,
    },
    types::{AggregateOptions, Builder, Expiration, RedisConfig as FredRedisConfig, RedisValue, SetOptions},
};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Deletes KEYS[1] only while it holds ARGV[1]
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

fn px(ttl: Duration) -> Expiration {
    Expiration::PX(ttl.as_millis().max(1) as i64)
}

/// Redis-backed cache, lock and ledger storage
#[derive(Clone)]
pub struct RedisBackend {
    pool: RedisPool,
    config: RedisConfig,
}

impl RedisBackend {
    /// Build the fred pool and wait for it to connect
    pub async fn connect(config: RedisConfig) -> ForumResult<Self> {
        info!("Initializing Redis client with URL: {}", sanitize_url_for_logging(&config.url));

        let redis_config = FredRedisConfig::from_url(&config.url)
            .map_err(|e| ForumError::ConfigError(format!("Invalid Redis URL: {}", e)))?;

        let timeout_secs = config.connection_timeout_secs;
        let pool = Builder::from_config(redis_config)
            .with_connection_config(|conn_config| {
                conn_config.connection_timeout = Duration::from_secs(timeout_secs);
            })
            .with_performance_config(|perf_config| {
                perf_config.auto_pipeline = true;
                perf_config.default_command_timeout = Duration::from_secs(timeout_secs);
            })
            .build_pool(config.max_connections as usize)
            .map_err(|e| ForumError::RedisError(format!("Failed to create Redis pool: {}", e)))?;

        pool.init()
            .await
            .map_err(|e| ForumError::RedisError(format!("Failed to connect to Redis: {}", e)))?;

        info!(pool_size = config.max_connections, "Redis client connected successfully");
        Ok(Self { pool, config })
    }

    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }

    /// Ping bounded by `deadline`
    pub async fn health_check(&self, deadline: Duration) -> ForumResult<()> {
        match timeout(deadline, self.pool.ping::<String>()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                error!("Redis health check failed: {}", e);
                Err(ForumError::RedisError(format!("Health check failed: {}", e)))
            }
            Err(_) => {
                error!("Redis health check timed out");
                Err(ForumError::RedisError("Health check timed out".to_string()))
            }
        }
    }

    pub async fn quit(&self) -> ForumResult<()> {
        self.pool.quit().await?;
        info!("Redis client disconnected");
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> ForumResult<Option<String>> {
        Ok(self.pool.get(key).await?)
    }

    async fn mget(&self, keys: &[String]) -> ForumResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.pool.mget(keys.to_vec()).await?)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> ForumResult<()> {
        let _: () = self.pool.set(key, value, Some(px(ttl)), None, false).await?;
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, String)>, ttl: Duration) -> ForumResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let count = entries.len();
        let pipeline = self.pool.next().pipeline();
        for (key, value) in entries {
            let _: () = pipeline.set(key, value, Some(px(ttl)), None, false).await?;
        }
        let _: Vec<RedisValue> = pipeline.all().await?;

        debug!(count, "Pipelined cache writes sent");
        Ok(())
    }

    async fn del(&self, key: &str) -> ForumResult<()> {
        let _: i64 = self.pool.del(key).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> ForumResult<bool> {
        let created: Option<String> = self
            .pool
            .set(key, value, Some(px(ttl)), Some(SetOptions::NX), false)
            .await?;
        Ok(created.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> ForumResult<bool> {
        let deleted: i64 = self
            .pool
            .eval(COMPARE_AND_DELETE, vec![key.to_string()], vec![expected.to_string()])
            .await?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> ForumResult<()> {
        let _: String = self.pool.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl SortedSetBackend for RedisBackend {
    async fn zscore(&self, key: &str, member: &str) -> ForumResult<Option<f64>> {
        Ok(self.pool.zscore(key, member).await?)
    }

    async fn zmscore(&self, key: &str, members: &[String]) -> ForumResult<Vec<Option<f64>>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.pool.zmscore(key, members.to_vec()).await?)
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> ForumResult<Vec<String>> {
        Ok(self.pool.zrevrange(key, start, stop, false).await?)
    }

    async fn exists(&self, key: &str) -> ForumResult<bool> {
        let count: i64 = self.pool.exists(key).await?;
        Ok(count > 0)
    }

    async fn intersect_into(&self, dest: &str, zset_key: &str, set_key: &str, ttl: Duration) -> ForumResult<()> {
        let trx = self.pool.next().multi();
        // set members score 1, so weight them out and keep the zset score
        let _: () = trx
            .zinterstore(
                dest,
                vec![set_key.to_string(), zset_key.to_string()],
                vec![0.0, 1.0],
                Some(AggregateOptions::Sum),
            )
            .await?;
        let _: () = trx
            .custom(
                fred::types::CustomCommand::new_static("PEXPIRE", fred::types::ClusterHash::FirstKey, false),
                vec![RedisValue::from(dest), RedisValue::from(ttl.as_millis().max(1) as i64)],
            )
            .await?;
        let _: RedisValue = trx.exec(true).await?;
        Ok(())
    }

    async fn exec_atomic(&self, ops: Vec<LedgerOp>) -> ForumResult<()> {
        let trx = self.pool.next().multi();
        for op in ops {
            match op {
                LedgerOp::IncrementScore { key, member, delta } => {
                    let _: () = trx.zincrby(key, delta, member).await?;
                }
                LedgerOp::SetScore { key, member, score } => {
                    let _: () = trx.zadd(key, None, None, false, false, (score, member)).await?;
                }
                LedgerOp::RemoveMember { key, member } => {
                    let _: () = trx.zrem(key, member).await?;
                }
                LedgerOp::AddToSet { key, member } => {
                    let _: () = trx.sadd(key, member).await?;
                }
            }
        }
        let _: RedisValue = trx.exec(true).await?;
        Ok(())
    }
}
