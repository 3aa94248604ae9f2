pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod id;
pub mod observability;
pub mod service;
pub mod types;
pub mod vote;

pub use error::{ForumError, ForumResult};
pub use types::*;
pub use config::Config;
pub use cache::{CacheAsideStore, CacheStats, RedisBackend};
pub use database::{BatchFetcher, ConnectionPoolManager, PoolHealth, PoolStats, PostgresClient};
pub use id::{IdGenerator, SnowflakeGenerator};
pub use service::{ForumCacheStats, ForumService};
pub use vote::VoteLedger;
