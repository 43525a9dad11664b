//! A small Redis cache for routing-engine responses.
//!
//! Route geometry for a given (start, finish) pair is stable over hours,
//! and the public OSRM demo server is slow and rate-limited, so we keep
//! responses for 24 hours.

use std::time::Instant;

use anyhow::{Context, Result};
use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use metrics::{describe_histogram, histogram, Unit};
use tracing::instrument;

/// How long cached routes live, in seconds.
pub const ROUTE_TTL_SECONDS: usize = 60 * 60 * 24;

/// A pooled Redis client storing route JSON by key.
#[derive(Clone)]
pub struct RouteCache {
    pool: Pool<RedisConnectionManager>,
}

impl RouteCache {
    #[instrument(name = "RouteCache::new", level = "trace", skip_all)]
    pub async fn new(redis_url: &str) -> Result<RouteCache> {
        describe_histogram!(
            "fuelrouter.redis.get_request.duration_seconds",
            Unit::Seconds,
            "Time required for Redis GET requests"
        );
        describe_histogram!(
            "fuelrouter.redis.set_request.duration_seconds",
            Unit::Seconds,
            "Time required for Redis SET requests"
        );

        let manager = RedisConnectionManager::new(redis_url)
            .context("could not create Redis connection manager")?;
        let pool = Pool::builder()
            .build(manager)
            .await
            .context("could not create Redis connection pool")?;
        Ok(RouteCache { pool })
    }

    async fn client(&self) -> Result<PooledConnection<'_, RedisConnectionManager>> {
        self.pool.get().await.context("could not get Redis client")
    }

    #[instrument(name = "RouteCache::get", level = "trace", skip_all)]
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let start = Instant::now();

        let mut client = self.client().await?;
        let result = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *client)
            .await
            .context("could not fetch key from Redis")?;

        histogram!(
            "fuelrouter.redis.get_request.duration_seconds",
            (Instant::now() - start).as_secs_f64(),
        );

        Ok(result)
    }

    #[instrument(name = "RouteCache::set_ex", level = "trace", skip_all)]
    pub async fn set_ex(&self, key: &str, value: &str, ttl_seconds: usize) -> Result<()> {
        let start = Instant::now();

        let mut client = self.client().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<_, ()>(&mut *client)
            .await
            .context("could not store key in Redis")?;

        histogram!(
            "fuelrouter.redis.set_request.duration_seconds",
            (Instant::now() - start).as_secs_f64(),
        );

        Ok(())
    }
}
