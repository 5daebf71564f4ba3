//! Redis-backed key-value cache.
//!
//! Backs the score cache (short TTL) and the reject store (long TTL).
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_ENABLED`: Set to "false" to disable the cache (default: true)
//! - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use concord_core::{Error, KeyValueCache, Result};

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 500;

/// Key-value cache backed by Redis.
///
/// A disabled or unconnected cache reports every call as a [`Error::Cache`];
/// callers treat that as a miss.
#[derive(Clone)]
pub struct RedisCache {
    inner: Arc<RedisCacheInner>,
}

struct RedisCacheInner {
    /// Redis connection manager (None if disabled).
    connection: RwLock<Option<ConnectionManager>>,
    enabled: bool,
}

impl RedisCache {
    /// Create a cache from environment configuration.
    ///
    /// Connection failures leave the cache disabled rather than failing startup.
    pub async fn from_env() -> Self {
        let enabled = std::env::var("REDIS_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        if !enabled {
            info!(
                subsystem = "cache",
                component = "redis",
                "Redis cache disabled via REDIS_ENABLED=false"
            );
            return Self::disabled();
        }
        Self::connect(&redis_url).await
    }

    /// Connect to the given URL, falling back to a disabled cache on failure.
    pub async fn connect(redis_url: &str) -> Self {
        let connection = match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    info!(
                        subsystem = "cache",
                        component = "redis",
                        url = %redis_url.replace(|c: char| c.is_ascii_alphanumeric(), "*"),
                        "Redis cache enabled"
                    );
                    Some(conn)
                }
                Err(e) => {
                    warn!(
                        subsystem = "cache",
                        component = "redis",
                        error = %e,
                        "Failed to connect to Redis, cache disabled"
                    );
                    None
                }
            },
            Err(e) => {
                warn!(
                    subsystem = "cache",
                    component = "redis",
                    error = %e,
                    "Invalid Redis URL, cache disabled"
                );
                None
            }
        };

        let enabled = connection.is_some();
        Self {
            inner: Arc::new(RedisCacheInner {
                connection: RwLock::new(connection),
                enabled,
            }),
        }
    }

    /// Create a disabled cache (for testing or when Redis is unavailable).
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(RedisCacheInner {
                connection: RwLock::new(None),
                enabled: false,
            }),
        }
    }

    /// Check if caching is enabled and connected.
    pub async fn is_connected(&self) -> bool {
        self.inner.enabled && self.inner.connection.read().await.is_some()
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        // ConnectionManager is a cheap multiplexed handle; clone it out so no
        // lock is held across the round trip.
        self.inner
            .connection
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Cache("redis cache disabled".to_string()))
    }
}

fn cache_err(op: &str, e: redis::RedisError) -> Error {
    Error::Cache(format!("redis {} failed: {}", op, e))
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value = conn
            .get::<_, Option<String>>(key)
            .await
            .map_err(|e| cache_err("GET", e))?;
        debug!(
            subsystem = "cache",
            component = "redis",
            op = "get",
            key,
            hit = value.is_some(),
            "Cache lookup"
        );
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| cache_err("SET", e))?;
        debug!(
            subsystem = "cache",
            component = "redis",
            op = "set",
            key,
            ttl_secs,
            "Cache write"
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| cache_err("DEL", e))?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        // SCAN instead of KEYS so large keyspaces never block the server.
        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
                .map_err(|e| cache_err("SCAN", e))?;
            if !keys.is_empty() {
                let n = conn
                    .del::<_, u64>(&keys[..])
                    .await
                    .map_err(|e| cache_err("DEL", e))?;
                deleted += n;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(
            subsystem = "cache",
            component = "redis",
            op = "delete_pattern",
            pattern,
            result_count = deleted,
            "Cache pattern invalidation"
        );
        Ok(deleted)
    }
}
