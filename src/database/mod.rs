/// Database module
///
/// Dual-pool connection management with read/write separation, batched
/// IN-query fetching and the relational queries behind posts, users and
/// communities.

mod batch;
mod pool_manager;
mod postgres_client;
mod schema;


pub use batch::{BatchFetcher, BatchResult, BatchSource};
pub use pool_manager::{ConnectionPoolManager, PoolHealth, PoolRole, PoolStats};
pub use postgres_client::PostgresClient;
pub use schema::{DatabaseSchema, Migration, Migrations};
