use crate::cache::{
    BatchLoader, CacheAsideStore, CacheBackend, CacheStats, EntityLoader, KeySpace, RedisBackend,
    SortedSetBackend, StoreSettings,
};
use crate::config::Config;
use crate::database::{BatchFetcher, ConnectionPoolManager, PoolHealth, PoolStats, PostgresClient};
use crate::error::{ForumError, ForumResult};
use crate::id::{IdGenerator, SnowflakeGenerator};
use crate::observability::ForumMetrics;
use crate::types::{Community, CommunityDetail, NewPost, Post, PostDetail, PostOrder, User, VoteDirection};
use crate::vote::VoteLedger;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Builds post details from posts, cached authors and communities, and ledger scores
pub struct PostDetailLoader {
    posts: Arc<dyn EntityLoader<Post>>,
    users: Arc<CacheAsideStore<User>>,
    communities: Arc<CacheAsideStore<CommunityDetail>>,
    ledger: Arc<VoteLedger>,
}

impl PostDetailLoader {
    pub fn new(
        posts: Arc<dyn EntityLoader<Post>>,
        users: Arc<CacheAsideStore<User>>,
        communities: Arc<CacheAsideStore<CommunityDetail>>,
        ledger: Arc<VoteLedger>,
    ) -> Self {
        Self {
            posts,
            users,
            communities,
            ledger,
        }
    }

    /// Resolve authors and communities in one batch each, scores in one round trip.
    ///
    /// Posts whose author or community is gone are skipped.
    pub async fn compose(&self, posts: Vec<Post>) -> ForumResult<Vec<PostDetail>> {
        if posts.is_empty() {
            return Ok(Vec::new());
        }

        let author_ids: Vec<i64> = posts.iter().map(|post| post.author_id).collect();
        let community_ids: Vec<i64> = posts.iter().map(|post| post.community_id).collect();
        let post_ids: Vec<i64> = posts.iter().map(|post| post.id).collect();

        let (users, communities, scores) = tokio::try_join!(
            self.users.batch_get(&author_ids),
            self.communities.batch_get(&community_ids),
            self.ledger.scores(&post_ids),
        )?;

        let mut details = Vec::with_capacity(posts.len());
        for post in posts {
            let Some(author) = users.get(&post.author_id) else {
                error!(post_id = post.id, author_id = post.author_id, "Author missing, skipping post");
                continue;
            };
            let Some(community) = communities.get(&post.community_id).cloned() else {
                error!(post_id = post.id, community_id = post.community_id, "Community missing, skipping post");
                continue;
            };
            let score = scores.get(&post.id).copied().unwrap_or(0.0);
            details.push(PostDetail::compose(post, author, community, score));
        }
        Ok(details)
    }
}

#[async_trait]
impl EntityLoader<PostDetail> for PostDetailLoader {
    async fn load_one(&self, id: i64) -> ForumResult<Option<PostDetail>> {
        let Some(post) = self.posts.load_one(id).await? else {
            return Ok(None);
        };
        Ok(self.compose(vec![post]).await?.pop())
    }

    async fn load_many(&self, ids: &[i64]) -> ForumResult<HashMap<i64, PostDetail>> {
        let posts = self.posts.load_many(ids).await?;
        let details = self.compose(posts.into_values().collect()).await?;
        Ok(details.into_iter().map(|detail| (detail.post.id, detail)).collect())
    }
}

/// Per-entity cache counters
#[derive(Debug, Clone, Serialize)]
pub struct ForumCacheStats {
    pub posts: CacheStats,
    pub users: CacheStats,
    pub communities: CacheStats,
}

/// Details for `ids` in that order, skipping ids with no detail
pub(crate) fn order_by_ids(ids: &[i64], mut details: HashMap<i64, PostDetail>) -> Vec<PostDetail> {
    ids.iter().filter_map(|id| details.remove(id)).collect()
}

/// Entry point for callers: reads through the caches, votes through the ledger
pub struct ForumService {
    pools: Arc<ConnectionPoolManager>,
    db: Arc<PostgresClient>,
    redis: Option<RedisBackend>,
    posts: CacheAsideStore<PostDetail>,
    users: Arc<CacheAsideStore<User>>,
    communities: Arc<CacheAsideStore<CommunityDetail>>,
    details: Arc<PostDetailLoader>,
    ledger: Arc<VoteLedger>,
    ids: Arc<dyn IdGenerator>,
    metrics: ForumMetrics,
}

impl ForumService {
    /// Connect to Postgres and Redis and wire every component
    pub async fn connect(config: Config) -> ForumResult<Self> {
        info!("Initializing forum service");

        let metrics = ForumMetrics::new()?;
        let pools = ConnectionPoolManager::connect(config.database.clone()).await?;
        pools.spawn_stats_monitor(Some(metrics.clone()));

        let redis = RedisBackend::connect(config.redis.clone()).await?;
        let ids = Arc::new(SnowflakeGenerator::new(config.id_node)?);

        let backend = Arc::new(redis.clone());
        let mut service = Self::with_backends(&config, pools, backend, ids, metrics);
        service.redis = Some(redis);

        info!("Forum service initialized successfully");
        Ok(service)
    }

    /// Wire the service over an already connected pool manager and cache
    pub fn with_backends<B>(
        config: &Config,
        pools: Arc<ConnectionPoolManager>,
        backend: Arc<B>,
        ids: Arc<dyn IdGenerator>,
        metrics: ForumMetrics,
    ) -> Self
    where
        B: CacheBackend + SortedSetBackend + 'static,
    {
        let keys = KeySpace::new(config.redis.key_prefix.clone());
        let fetcher = BatchFetcher::new(config.database.max_batch_size);
        let db = Arc::new(PostgresClient::new(Arc::clone(&pools)));
        let cache: Arc<dyn CacheBackend> = backend.clone();
        let settings = |ttl_secs: u64| StoreSettings {
            ttl: Duration::from_secs(ttl_secs),
            lock_ttl: config.cache.lock_ttl(),
            lock_retry: config.cache.lock_retry(),
        };

        let ledger = Arc::new(VoteLedger::new(
            backend,
            keys.clone(),
            &config.vote,
            Some(metrics.clone()),
        ));
        let users: Arc<CacheAsideStore<User>> = Arc::new(CacheAsideStore::new(
            Arc::clone(&cache),
            Arc::new(BatchLoader::new(Arc::clone(&db), fetcher)),
            keys.clone(),
            settings(config.cache.user_ttl_secs),
            Some(metrics.clone()),
        ));
        let communities: Arc<CacheAsideStore<CommunityDetail>> = Arc::new(CacheAsideStore::new(
            Arc::clone(&cache),
            Arc::new(BatchLoader::new(Arc::clone(&db), fetcher)),
            keys.clone(),
            settings(config.cache.community_ttl_secs),
            Some(metrics.clone()),
        ));
        let details = Arc::new(PostDetailLoader::new(
            Arc::new(BatchLoader::new(Arc::clone(&db), fetcher)),
            Arc::clone(&users),
            Arc::clone(&communities),
            Arc::clone(&ledger),
        ));
        let posts: CacheAsideStore<PostDetail> = CacheAsideStore::new(
            cache,
            details.clone(),
            keys,
            settings(config.cache.post_ttl_secs),
            Some(metrics.clone()),
        );

        Self {
            pools,
            db,
            redis: None,
            posts,
            users,
            communities,
            details,
            ledger,
            ids,
            metrics,
        }
    }

    pub fn metrics(&self) -> &ForumMetrics {
        &self.metrics
    }

    pub async fn initialize_schema(&self) -> ForumResult<()> {
        self.db.initialize_schema().await
    }

    pub async fn get_detail(&self, post_id: i64) -> ForumResult<PostDetail> {
        self.posts
            .get(post_id)
            .await?
            .ok_or_else(|| ForumError::NotFound(format!("Post {} not found", post_id)))
    }

    /// Newest posts from the database; `page` starts at 1
    pub async fn get_list(&self, page: i64, size: i64) -> ForumResult<Vec<PostDetail>> {
        let posts = self.db.list_posts(page, size).await?;
        self.details.compose(posts).await
    }

    /// A page ordered by the vote ledger
    pub async fn get_list_ordered(&self, order: PostOrder, page: i64, size: i64) -> ForumResult<Vec<PostDetail>> {
        let ids = self.ledger.post_ids_in_order(order, page, size).await?;
        if ids.is_empty() {
            warn!(?order, page, size, "Ledger returned no posts for page");
            return Ok(Vec::new());
        }
        let details = self.posts.batch_get(&ids).await?;
        Ok(order_by_ids(&ids, details))
    }

    /// A page of one community's posts ordered by the vote ledger
    pub async fn get_community_list(
        &self,
        community_id: i64,
        order: PostOrder,
        page: i64,
        size: i64,
    ) -> ForumResult<Vec<PostDetail>> {
        let ids = self
            .ledger
            .community_post_ids_in_order(community_id, order, page, size)
            .await?;
        if ids.is_empty() {
            warn!(community_id, ?order, page, size, "Ledger returned no community posts for page");
            return Ok(Vec::new());
        }
        let details = self.posts.batch_get(&ids).await?;
        Ok(order_by_ids(&ids, details))
    }

    /// Partial results allowed: ids without a post are absent
    pub async fn batch_get_detail(&self, post_ids: &[i64]) -> ForumResult<HashMap<i64, PostDetail>> {
        self.posts.batch_get(post_ids).await
    }

    /// Apply a vote, then drop the cached detail so the next read sees the new score
    pub async fn submit_vote(&self, user_id: i64, post_id: i64, direction: VoteDirection) -> ForumResult<()> {
        self.ledger.submit_vote(user_id, post_id, direction).await?;
        if let Err(e) = self.posts.invalidate(post_id).await {
            warn!(post_id, "Failed to invalidate post detail after vote: {}", e);
        }
        Ok(())
    }

    /// Insert through the write pool and register the post in the ledger
    pub async fn create_post(&self, new_post: NewPost) -> ForumResult<Post> {
        let id = self.ids.next_id()?;
        let post = self.db.create_post(id, &new_post).await?;
        self.ledger.post_created(post.id, post.community_id).await.map_err(|e| {
            error!(post_id = post.id, "Post stored but ledger registration failed: {}", e);
            e
        })?;
        info!(post_id = post.id, community_id = post.community_id, "Post created");
        Ok(post)
    }

    pub async fn get_user(&self, user_id: i64) -> ForumResult<User> {
        self.users
            .get(user_id)
            .await?
            .ok_or_else(|| ForumError::NotFound(format!("User {} not found", user_id)))
    }

    /// Signup; the password must already be hashed
    pub async fn create_user(&self, username: &str, password_hash: &str) -> ForumResult<User> {
        let id = self.ids.next_id()?;
        self.db.create_user(id, username, password_hash).await
    }

    /// Login lookup, bypassing the cache since it needs the password hash
    pub async fn find_user_by_username(&self, username: &str) -> ForumResult<Option<User>> {
        self.db.find_user_by_username(username).await
    }

    pub async fn list_communities(&self) -> ForumResult<Vec<Community>> {
        self.db.list_communities().await
    }

    pub async fn get_community_detail(&self, community_id: i64) -> ForumResult<CommunityDetail> {
        self.communities
            .get(community_id)
            .await?
            .ok_or_else(|| ForumError::NotFound(format!("Community {} not found", community_id)))
    }

    pub fn stats(&self) -> PoolStats {
        self.pools.snapshot()
    }

    pub fn cache_stats(&self) -> ForumCacheStats {
        ForumCacheStats {
            posts: self.posts.cache_stats(),
            users: self.users.cache_stats(),
            communities: self.communities.cache_stats(),
        }
    }

    /// Database health, degraded when Redis is unreachable
    pub async fn health_check(&self, deadline: Duration) -> PoolHealth {
        let health = self.pools.health_check(deadline).await;
        let Some(redis) = &self.redis else {
            return health;
        };

        match (health, redis.health_check(deadline).await) {
            (health, Ok(())) => health,
            (PoolHealth::Healthy, Err(e)) => PoolHealth::Degraded(vec![format!("cache: {}", e)]),
            (PoolHealth::Degraded(mut warnings), Err(e)) => {
                warnings.push(format!("cache: {}", e));
                PoolHealth::Degraded(warnings)
            }
            (unhealthy, Err(_)) => unhealthy,
        }
    }

    /// Close the pools and disconnect from Redis, reporting every failure
    pub async fn close(&self) -> ForumResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.pools.close() {
            errors.push(e.to_string());
        }
        if let Some(redis) = &self.redis {
            if let Err(e) = redis.quit().await {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            info!("Forum service closed");
            Ok(())
        } else {
            Err(ForumError::Internal(format!("Errors during shutdown: {}", errors.join("; "))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryBackend;
    use chrono::Utc;

    /// Fixed rows standing in for the database
    struct StaticLoader<T> {
        rows: HashMap<i64, T>,
    }

    impl<T: Clone> StaticLoader<T> {
        fn new(rows: Vec<(i64, T)>) -> Arc<Self> {
            Arc::new(Self {
                rows: rows.into_iter().collect(),
            })
        }
    }

    #[async_trait]
    impl<T: Clone + Send + Sync> EntityLoader<T> for StaticLoader<T> {
        async fn load_one(&self, id: i64) -> ForumResult<Option<T>> {
            Ok(self.rows.get(&id).cloned())
        }

        async fn load_many(&self, ids: &[i64]) -> ForumResult<HashMap<i64, T>> {
            Ok(ids
                .iter()
                .filter_map(|id| self.rows.get(id).map(|row| (*id, row.clone())))
                .collect())
        }
    }

    fn post(id: i64, author_id: i64, community_id: i64) -> Post {
        Post {
            id,
            title: format!("Post {}", id),
            content: "body".to_string(),
            author_id,
            community_id,
            status: 1,
            create_time: Utc::now(),
        }
    }

    fn settings() -> StoreSettings {
        StoreSettings {
            ttl: Duration::from_secs(1800),
            lock_ttl: Duration::from_secs(10),
            lock_retry: Duration::from_millis(50),
        }
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        ledger: Arc<VoteLedger>,
        details: Arc<PostDetailLoader>,
        store: CacheAsideStore<PostDetail>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let keys = KeySpace::new("test");
        let ledger = Arc::new(VoteLedger::new(backend.clone(), keys.clone(), &Config::default().vote, None));

        let users: Arc<CacheAsideStore<User>> = Arc::new(CacheAsideStore::new(
            backend.clone(),
            StaticLoader::new(vec![(7, User {
                id: 7,
                username: "alice".to_string(),
                password_hash: "hash".to_string(),
            })]),
            keys.clone(),
            settings(),
            None,
        ));
        let communities: Arc<CacheAsideStore<CommunityDetail>> = Arc::new(CacheAsideStore::new(
            backend.clone(),
            StaticLoader::new(vec![(1, CommunityDetail {
                id: 1,
                name: "rust".to_string(),
                introduction: "systems programming".to_string(),
                create_time: Utc::now(),
            })]),
            keys.clone(),
            settings(),
            None,
        ));
        let posts = StaticLoader::new(vec![(10, post(10, 7, 1)), (11, post(11, 8, 1)), (12, post(12, 7, 2))]);

        let details = Arc::new(PostDetailLoader::new(posts, users, communities, Arc::clone(&ledger)));
        let store = CacheAsideStore::new(backend.clone(), details.clone(), keys, settings(), None);

        Fixture {
            backend,
            ledger,
            details,
            store,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_compose_skips_posts_with_missing_parts() {
        let fixture = fixture();
        fixture.ledger.post_created(10, 1).await.unwrap();
        fixture.ledger.submit_vote(3, 10, VoteDirection::Up).await.unwrap();

        // 11 has an unknown author, 12 an unknown community
        let details = fixture
            .details
            .compose(vec![post(10, 7, 1), post(11, 8, 1), post(12, 7, 2)])
            .await
            .unwrap();

        assert_eq!(details.len(), 1);
        assert_eq!(details[0].author_name, "alice");
        assert_eq!(details[0].community.name, "rust");
        assert_eq!(details[0].vote_score, 432.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detail_read_through_and_invalidate_after_vote() {
        let fixture = fixture();
        fixture.ledger.post_created(10, 1).await.unwrap();

        let before = fixture.store.get(10).await.unwrap().unwrap();
        assert_eq!(before.vote_score, 0.0);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(fixture.backend.raw(&fixture.store.cache_key(10)).is_some());

        fixture.ledger.submit_vote(3, 10, VoteDirection::Up).await.unwrap();
        fixture.store.invalidate(10).await.unwrap();

        let after = fixture.store.get(10).await.unwrap().unwrap();
        assert_eq!(after.vote_score, 432.0);
        assert_eq!(after.post, before.post);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_detail_allows_partial_results() {
        let fixture = fixture();

        let details = fixture.store.batch_get(&[10, 11, 10, 404]).await.unwrap();

        assert_eq!(details.len(), 1);
        assert!(details.contains_key(&10));
    }

    #[test]
    fn test_order_by_ids_preserves_ledger_order() {
        let details: HashMap<i64, PostDetail> = [3_i64, 1]
            .iter()
            .map(|id| {
                let community = CommunityDetail {
                    id: 1,
                    name: "rust".to_string(),
                    introduction: String::new(),
                    create_time: Utc::now(),
                };
                let author = User {
                    id: 7,
                    username: "alice".to_string(),
                    password_hash: String::new(),
                };
                (*id, PostDetail::compose(post(*id, 7, 1), &author, community, 0.0))
            })
            .collect();

        let ordered = order_by_ids(&[3, 2, 1], details);
        let ids: Vec<i64> = ordered.iter().map(|detail| detail.post.id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[tokio::test]
    #[ignore = "requires Postgres and Redis connections"]
    async fn test_service_end_to_end() {
        let config = Config::from_env().unwrap();
        let service = ForumService::connect(config).await.unwrap();
        service.initialize_schema().await.unwrap();

        let username = format!("user-{}", uuid::Uuid::new_v4());
        let user = service.create_user(&username, "hash").await.unwrap();
        let communities = service.list_communities().await.unwrap();
        let Some(community) = communities.first() else {
            return;
        };

        let post = service
            .create_post(NewPost {
                title: "hello".to_string(),
                content: "world".to_string(),
                author_id: user.id,
                community_id: community.id,
            })
            .await
            .unwrap();

        service.submit_vote(user.id, post.id, VoteDirection::Up).await.unwrap();
        let detail = service.get_detail(post.id).await.unwrap();
        assert_eq!(detail.vote_score, 432.0);
        assert_eq!(detail.author_name, username);

        let listed = service
            .get_community_list(community.id, PostOrder::Score, 1, 10)
            .await
            .unwrap();
        assert!(listed.iter().any(|item| item.post.id == post.id));

        assert!(service.health_check(Duration::from_secs(2)).await.is_serving());
        service.close().await.unwrap();
    }
}
