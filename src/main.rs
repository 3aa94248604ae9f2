use anyhow::Context;
use forum_core::observability::init_logging;
use forum_core::{Config, ForumService, PoolHealth};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    tracing::info!("Starting forum core");

    let config = Config::from_env().context("Failed to load configuration")?;
    let service = ForumService::connect(config)
        .await
        .context("Failed to initialize forum service")?;

    match service.health_check(Duration::from_secs(5)).await {
        PoolHealth::Healthy => tracing::info!("Health check passed"),
        PoolHealth::Degraded(warnings) => tracing::warn!(?warnings, "Health check degraded"),
        PoolHealth::Unhealthy(e) => {
            service.close().await.ok();
            return Err(e).context("Health check failed");
        }
    }

    let stats = service.stats();
    tracing::info!(
        open_connections = stats.open_connections,
        max_open_connections = stats.max_open_connections,
        read_pool_count = stats.read_pool_count,
        "Connection pools ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    let cache = service.cache_stats();
    tracing::info!(
        post_hit_ratio = cache.posts.hit_ratio(),
        user_hit_ratio = cache.users.hit_ratio(),
        community_hit_ratio = cache.communities.hit_ratio(),
        cache = ?cache,
        pools = ?service.stats(),
        "Final statistics"
    );
    service.close().await?;
    Ok(())
}
