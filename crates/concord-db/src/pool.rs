//! PostgreSQL pool for the concord stores.
//!
//! Every store in [`crate::Database`] shares one pool. Merges hold a
//! connection across their graph steps and corpus runs score with several
//! pairs in flight, so the pool is sized for the scoring concurrency plus
//! one merge, not for request fan-out.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use concord_core::defaults::SCORING_CONCURRENCY;
use concord_core::{Error, Result};

/// Connections kept open while idle; merges rarely wait for a fresh one.
const MIN_CONNECTIONS: u32 = 1;

/// Idle connections are closed after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Connections are recycled after this long.
const MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// Pool sizing for one engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// Bounds both connecting and waiting for a free connection. A store
    /// call that waits longer fails as unreachable.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: SCORING_CONCURRENCY as u32 + 2,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CONCORD_DB_MAX_CONNECTIONS` | scoring concurrency + 2 | Pool size |
    /// | `CONCORD_DB_ACQUIRE_TIMEOUT_SECS` | `30` | Connect and acquire bound |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let max_connections = lookup("CONCORD_DB_MAX_CONNECTIONS")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_connections);
        let acquire_timeout = lookup("CONCORD_DB_ACQUIRE_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.acquire_timeout);
        Self {
            max_connections,
            acquire_timeout,
        }
    }
}

/// Open the shared pool.
pub async fn open_pool(database_url: &str, settings: &PoolSettings) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(MIN_CONNECTIONS.min(settings.max_connections))
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(IDLE_TIMEOUT)
        .max_lifetime(MAX_LIFETIME)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "open",
        max_connections = settings.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Store pool open"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_covers_scoring_concurrency() {
        let settings = PoolSettings::default();
        assert!(settings.max_connections as usize > SCORING_CONCURRENCY);
    }

    #[test]
    fn test_settings_from_lookup() {
        let settings = PoolSettings::from_lookup(|key| match key {
            "CONCORD_DB_MAX_CONNECTIONS" => Some("4".to_string()),
            "CONCORD_DB_ACQUIRE_TIMEOUT_SECS" => Some(" 5 ".to_string()),
            _ => None,
        });
        assert_eq!(settings.max_connections, 4);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(5));

        // Zero or garbage falls back to the defaults.
        let settings = PoolSettings::from_lookup(|key| match key {
            "CONCORD_DB_MAX_CONNECTIONS" => Some("0".to_string()),
            _ => Some("soon".to_string()),
        });
        assert_eq!(settings, PoolSettings::default());
    }
}
