use std::env;
use std::str::FromStr;
use std::time::Duration;
use crate::error::{ForumError, ForumResult};
use crate::types::MAX_PAGE_SIZE;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Cache-aside configuration
    pub cache: CacheConfig,
    /// Voting configuration
    pub vote: VoteConfig,
    /// Snowflake node id for id generation
    pub id_node: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Primary (write) database URL
    pub url: String,
    /// Read replica URLs
    pub read_urls: Vec<String>,
    /// Route reads to replicas when available
    pub read_write_split: bool,
    /// Maximum connections per pool
    pub max_connections: u32,
    /// Connection acquisition timeout in seconds
    pub connection_timeout_secs: u64,
    /// Deadline for ordinary queries in milliseconds
    pub query_timeout_ms: u64,
    /// Maximum unique ids per batched IN query
    pub max_batch_size: usize,
    /// Interval of the pool statistics ticker in seconds
    pub stats_interval_secs: u64,
    /// Queries slower than this are counted as slow
    pub slow_query_ms: u64,
}

/// Redis configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Maximum Redis connections
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,
    /// Namespace prefix for every key
    pub key_prefix: String,
}

/// Cache-aside configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub post_ttl_secs: u64,
    pub user_ttl_secs: u64,
    pub community_ttl_secs: u64,
    /// Stampede lock expiry in seconds
    pub lock_ttl_secs: u64,
    /// Wait before re-reading the cache when the lock is busy
    pub lock_retry_ms: u64,
}

/// Voting configuration
#[derive(Debug, Clone)]
pub struct VoteConfig {
    /// Seconds after creation during which votes are accepted
    pub window_secs: i64,
    /// Score applied per vote
    pub weight: f64,
}

impl DatabaseConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }
}

impl CacheConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }
}

fn env_or<T>(name: &str, default: &str) -> ForumResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|e| ForumError::ConfigError(format!("Invalid {}: {}", name, e)))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> ForumResult<Self> {
        // Load .env file if it exists
        if let Err(e) = dotenvy::dotenv() {
            tracing::warn!("Could not load .env file: {}", e);
        }

        let defaults = Config::default();

        let read_urls = env::var("DATABASE_READ_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let config = Config {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| ForumError::ConfigError("DATABASE_URL is required".to_string()))?,
                read_urls,
                read_write_split: env_or("DB_READ_WRITE_SPLIT", "true")?,
                max_connections: env_or("DB_MAX_CONNECTIONS", "10")?,
                connection_timeout_secs: env_or("DB_CONNECTION_TIMEOUT_SECS", "10")?,
                query_timeout_ms: env_or("DB_QUERY_TIMEOUT_MS", "5000")?,
                max_batch_size: env_or("DB_MAX_BATCH_SIZE", "1000")?,
                stats_interval_secs: env_or("DB_STATS_INTERVAL_SECS", "30")?,
                slow_query_ms: env_or("DB_SLOW_QUERY_MS", "1000")?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL")
                    .map_err(|_| ForumError::ConfigError("REDIS_URL is required".to_string()))?,
                max_connections: env_or("REDIS_MAX_CONNECTIONS", "10")?,
                connection_timeout_secs: env_or("REDIS_CONNECTION_TIMEOUT_SECS", "5")?,
                key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or(defaults.redis.key_prefix),
            },
            cache: CacheConfig {
                post_ttl_secs: env_or("CACHE_POST_TTL_SECS", "1800")?,
                user_ttl_secs: env_or("CACHE_USER_TTL_SECS", "3600")?,
                community_ttl_secs: env_or("CACHE_COMMUNITY_TTL_SECS", "7200")?,
                lock_ttl_secs: env_or("CACHE_LOCK_TTL_SECS", "10")?,
                lock_retry_ms: env_or("CACHE_LOCK_RETRY_MS", "50")?,
            },
            vote: VoteConfig {
                window_secs: env_or("VOTE_WINDOW_SECS", "604800")?,
                weight: env_or("VOTE_WEIGHT", "432")?,
            },
            id_node: env_or("ID_NODE", "1")?,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ForumResult<()> {
        let is_postgres = |url: &str| url.starts_with("postgres://") || url.starts_with("postgresql://");

        if !is_postgres(&self.database.url) {
            return Err(ForumError::ConfigError(
                "DATABASE_URL must start with postgres:// or postgresql://".to_string(),
            ));
        }

        if let Some(bad) = self.database.read_urls.iter().find(|url| !is_postgres(url)) {
            return Err(ForumError::ConfigError(format!("Invalid read replica URL scheme: {}", bad)));
        }

        if self.database.max_connections == 0 {
            return Err(ForumError::ConfigError("DB_MAX_CONNECTIONS must be greater than 0".to_string()));
        }

        if self.database.max_batch_size < MAX_PAGE_SIZE as usize {
            return Err(ForumError::ConfigError(format!(
                "DB_MAX_BATCH_SIZE must be at least the page size limit {}",
                MAX_PAGE_SIZE
            )));
        }

        if self.database.query_timeout_ms == 0 {
            return Err(ForumError::ConfigError("DB_QUERY_TIMEOUT_MS must be greater than 0".to_string()));
        }

        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ForumError::ConfigError("REDIS_URL must start with redis:// or rediss://".to_string()));
        }

        if self.cache.lock_ttl_secs == 0 {
            return Err(ForumError::ConfigError("CACHE_LOCK_TTL_SECS must be greater than 0".to_string()));
        }

        if self.vote.window_secs <= 0 || self.vote.weight <= 0.0 {
            return Err(ForumError::ConfigError("Voting window and weight must be positive".to_string()));
        }

        if self.id_node > 1023 {
            return Err(ForumError::ConfigError("ID_NODE must be in 0..=1023".to_string()));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: "".to_string(),
                read_urls: Vec::new(),
                read_write_split: true,
                max_connections: 10,
                connection_timeout_secs: 10,
                query_timeout_ms: 5000,
                max_batch_size: 1000,
                stats_interval_secs: 30,
                slow_query_ms: 1000,
            },
            redis: RedisConfig {
                url: "".to_string(),
                max_connections: 10,
                connection_timeout_secs: 5,
                key_prefix: "forum".to_string(),
            },
            cache: CacheConfig {
                post_ttl_secs: 30 * 60,
                user_ttl_secs: 60 * 60,
                community_ttl_secs: 2 * 60 * 60,
                lock_ttl_secs: 10,
                lock_retry_ms: 50,
            },
            vote: VoteConfig {
                window_secs: 7 * 24 * 3600,
                weight: 432.0,
            },
            id_node: 1,
        }
    }
}
