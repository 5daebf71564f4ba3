use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::RwLock;
use tokio::time::Instant;

use concord_core::{Error, KeyValueCache, Result};

use super::FailureSwitch;

/// In-memory [`KeyValueCache`] with per-key expiry.
///
/// Expiry uses the tokio clock, so tests can move time with
/// `tokio::time::advance` under a paused runtime.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    failures: FailureSwitch,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as an unreachable Redis would.
    pub fn set_failing(&self, failing: bool) {
        if failing {
            for op in ["get", "set_ex", "delete", "delete_pattern"] {
                self.failures.fail_on(op);
            }
        } else {
            self.failures.clear();
        }
    }

    /// Live keys, sorted. Test helper.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, (_, expires))| *expires > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Translate a Redis-style `*` glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let body = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", body))
        .map_err(|e| Error::Cache(format!("bad key pattern {}: {}", pattern, e)))
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.failures.check("get", Error::Cache)?;
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(v, _)| v.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.failures.check("set_ex", Error::Cache)?;
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.failures.check("delete", Error::Cache)?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        self.failures.check("delete_pattern", Error::Cache)?;
        let re = glob_to_regex(pattern)?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !re.is_match(k));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", 10).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_pattern_matches_glob() {
        let cache = MemoryCache::new();
        cache.set_ex("concord:t:score:a|b", "1", 60).await.unwrap();
        cache.set_ex("concord:t:score:b|c", "1", 60).await.unwrap();
        cache.set_ex("concord:t:reject:a|b", "1", 60).await.unwrap();
        cache.set_ex("concord:u:score:a|b", "1", 60).await.unwrap();

        let n = cache.delete_pattern("concord:t:score:*a*").await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            cache.keys().await,
            vec![
                "concord:t:reject:a|b".to_string(),
                "concord:t:score:b|c".to_string(),
                "concord:u:score:a|b".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_cache_reports_cache_error() {
        let cache = MemoryCache::new();
        cache.set_failing(true);
        assert!(matches!(cache.get("k").await, Err(Error::Cache(_))));
        cache.set_failing(false);
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
