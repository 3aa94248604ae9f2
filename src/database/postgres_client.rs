use super::batch::BatchSource;
use super::pool_manager::ConnectionPoolManager;
use super::schema::{DatabaseSchema, Migrations};
use crate::error::{ForumError, ForumResult};
use crate::types::{Community, CommunityDetail, NewPost, PageRequest, Post, User};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, info};

const POST_COLUMNS: &str = "post_id, title, content, author_id, community_id, status, create_time";
const USER_COLUMNS: &str = "user_id, username, password";
const COMMUNITY_COLUMNS: &str = "community_id, community_name, introduction, create_time";

/// Status of a newly created post
const POST_STATUS_PUBLISHED: i32 = 1;

/// `$1, $2, ..., $n`
fn in_placeholders(count: usize) -> String {
    (1..=count).map(|i| format!("${}", i)).collect::<Vec<_>>().join(", ")
}

fn id_params(ids: &[i64]) -> Vec<&(dyn ToSql + Sync)> {
    ids.iter().map(|id| id as &(dyn ToSql + Sync)).collect()
}

fn row_to_post(row: &Row) -> ForumResult<Post> {
    Ok(Post {
        id: row.try_get(0)?,
        title: row.try_get(1)?,
        content: row.try_get(2)?,
        author_id: row.try_get(3)?,
        community_id: row.try_get(4)?,
        status: row.try_get(5)?,
        create_time: row.try_get(6)?,
    })
}

fn row_to_user(row: &Row) -> ForumResult<User> {
    Ok(User {
        id: row.try_get(0)?,
        username: row.try_get(1)?,
        password_hash: row.try_get(2)?,
    })
}

fn row_to_community(row: &Row) -> ForumResult<CommunityDetail> {
    Ok(CommunityDetail {
        id: row.try_get(0)?,
        name: row.try_get(1)?,
        introduction: row.try_get(2)?,
        create_time: row.try_get(3)?,
    })
}

/// Relational queries routed through the pool manager.
///
/// Writes go to the write pool, reads to a read pool. Every query is timed
/// and bounded by the configured query deadline.
pub struct PostgresClient {
    pools: Arc<ConnectionPoolManager>,
}

impl PostgresClient {
    pub fn new(pools: Arc<ConnectionPoolManager>) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    /// Insert a post under `id`
    pub async fn create_post(&self, id: i64, new_post: &NewPost) -> ForumResult<Post> {
        debug!(post_id = id, "Creating post");

        self.pools
            .timed(async {
                let client = self.pools.write_connection().await?;
                let query = format!(
                    "INSERT INTO post (post_id, title, content, author_id, community_id, status)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     RETURNING {}",
                    POST_COLUMNS
                );
                let row = client
                    .query_one(
                        &query,
                        &[
                            &id,
                            &new_post.title,
                            &new_post.content,
                            &new_post.author_id,
                            &new_post.community_id,
                            &POST_STATUS_PUBLISHED,
                        ],
                    )
                    .await?;
                row_to_post(&row)
            })
            .await
    }

    /// Newest posts first; `page` starts at 1
    pub async fn list_posts(&self, page: i64, size: i64) -> ForumResult<Vec<Post>> {
        let page = PageRequest::new(page, size)?;
        let (limit, offset) = (page.size, page.offset());

        self.pools
            .timed(async {
                let client = self.pools.read_connection().await?;
                let query = format!(
                    "SELECT {} FROM post ORDER BY create_time DESC LIMIT $1 OFFSET $2",
                    POST_COLUMNS
                );
                let rows = client.query(&query, &[&limit, &offset]).await?;
                rows.iter().map(row_to_post).collect()
            })
            .await
    }

    pub async fn get_posts_by_ids(&self, ids: &[i64]) -> ForumResult<Vec<Post>> {
        self.select_in("post", POST_COLUMNS, "post_id", ids, row_to_post).await
    }

    pub async fn get_users_by_ids(&self, ids: &[i64]) -> ForumResult<Vec<User>> {
        self.select_in("users", USER_COLUMNS, "user_id", ids, row_to_user).await
    }

    /// Lookup used by login; reads from the write pool so a fresh signup is visible
    pub async fn find_user_by_username(&self, username: &str) -> ForumResult<Option<User>> {
        self.pools
            .timed(async {
                let client = self.pools.write_connection().await?;
                let query = format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS);
                client
                    .query_opt(&query, &[&username])
                    .await?
                    .map(|row| row_to_user(&row))
                    .transpose()
            })
            .await
    }

    /// Insert a user; a taken username is an invalid request
    pub async fn create_user(&self, id: i64, username: &str, password_hash: &str) -> ForumResult<User> {
        self.pools
            .timed(async {
                let client = self.pools.write_connection().await?;
                let query = format!(
                    "INSERT INTO users (user_id, username, password) VALUES ($1, $2, $3)
                     ON CONFLICT (username) DO NOTHING
                     RETURNING {}",
                    USER_COLUMNS
                );
                match client.query_opt(&query, &[&id, &username, &password_hash]).await? {
                    Some(row) => row_to_user(&row),
                    None => Err(ForumError::InvalidRequest(format!("User {} already exists", username))),
                }
            })
            .await
    }

    pub async fn list_communities(&self) -> ForumResult<Vec<Community>> {
        self.pools
            .timed(async {
                let client = self.pools.read_connection().await?;
                let rows = client
                    .query("SELECT community_id, community_name FROM community ORDER BY community_id", &[])
                    .await?;
                rows.iter()
                    .map(|row| -> ForumResult<Community> {
                        Ok(Community {
                            id: row.try_get(0)?,
                            name: row.try_get(1)?,
                        })
                    })
                    .collect()
            })
            .await
    }

    pub async fn get_communities_by_ids(&self, ids: &[i64]) -> ForumResult<Vec<CommunityDetail>> {
        self.select_in("community", COMMUNITY_COLUMNS, "community_id", ids, row_to_community)
            .await
    }

    /// Create tables and indexes if they do not exist
    pub async fn initialize_schema(&self) -> ForumResult<()> {
        info!("Initializing database schema");

        let client = self.pools.write_connection().await?;
        for migration in Migrations::get_all_migrations() {
            client.batch_execute(migration.up_sql).await.map_err(|e| {
                ForumError::DatabaseError(format!("Migration {} failed: {}", migration.name, e))
            })?;
        }
        for index_sql in DatabaseSchema::create_indexes_sql() {
            client
                .execute(index_sql, &[])
                .await
                .map_err(|e| ForumError::DatabaseError(format!("Failed to create index: {}", e)))?;
        }

        info!("Database schema initialized successfully");
        Ok(())
    }

    async fn select_in<T>(
        &self,
        table: &str,
        columns: &str,
        id_column: &str,
        ids: &[i64],
        map_row: fn(&Row) -> ForumResult<T>,
    ) -> ForumResult<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.pools
            .timed(async {
                let client = self.pools.read_connection().await?;
                let query = format!(
                    "SELECT {} FROM {} WHERE {} IN ({})",
                    columns,
                    table,
                    id_column,
                    in_placeholders(ids.len())
                );
                let rows = client.query(&query, &id_params(ids)).await?;
                debug!(table, requested = ids.len(), returned = rows.len(), "IN query complete");
                rows.iter().map(map_row).collect()
            })
            .await
    }
}

#[async_trait]
impl BatchSource<Post> for PostgresClient {
    async fn query_by_ids(&self, ids: &[i64]) -> ForumResult<Vec<Post>> {
        self.get_posts_by_ids(ids).await
    }
}

#[async_trait]
impl BatchSource<User> for PostgresClient {
    async fn query_by_ids(&self, ids: &[i64]) -> ForumResult<Vec<User>> {
        self.get_users_by_ids(ids).await
    }
}

#[async_trait]
impl BatchSource<CommunityDetail> for PostgresClient {
    async fn query_by_ids(&self, ids: &[i64]) -> ForumResult<Vec<CommunityDetail>> {
        self.get_communities_by_ids(ids).await
    }
}
