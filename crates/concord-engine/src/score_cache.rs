//! Positive score cache.
//!
//! Stores the signal breakdown of recently scored pairs under
//! `concord:{tenant}:score:{pair_id}` with a short TTL. Any cache failure is
//! a miss: the pipeline keeps going uncached and logs a warning.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use concord_core::defaults::CACHE_KEY_PREFIX;
use concord_core::{KeyValueCache, PairId, ScoreCacheEntry, SignalBreakdown};

/// `concord:{tenant}:{kind}:{pair_id}`
pub(crate) fn cache_key(tenant_id: &str, kind: &str, pair_id: &PairId) -> String {
    format!("{}:{}:{}:{}", CACHE_KEY_PREFIX, tenant_id, kind, pair_id)
}

/// Glob matching every `kind` entry whose pair contains `concept_id`.
pub(crate) fn concept_pattern(tenant_id: &str, kind: &str, concept_id: Uuid) -> String {
    format!("{}:{}:{}:*{}*", CACHE_KEY_PREFIX, tenant_id, kind, concept_id)
}

const KIND: &str = "score";

/// Tenant-scoped score cache over a key-value store.
#[derive(Clone)]
pub struct ScoreCache {
    cache: Option<Arc<dyn KeyValueCache>>,
    tenant_id: String,
    ttl_secs: u64,
}

impl ScoreCache {
    pub fn new(cache: Option<Arc<dyn KeyValueCache>>, tenant_id: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            cache,
            tenant_id: tenant_id.into(),
            ttl_secs,
        }
    }

    /// A cache that never hits.
    pub fn disabled(tenant_id: impl Into<String>) -> Self {
        Self::new(None, tenant_id, 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub async fn get(&self, pair_id: &PairId) -> Option<ScoreCacheEntry> {
        let cache = self.cache.as_ref()?;
        let key = cache_key(&self.tenant_id, KIND, pair_id);
        match cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<ScoreCacheEntry>(&raw) {
                Ok(entry) if entry.pair_id == *pair_id => {
                    debug!(pair_id = %pair_id, "Score cache hit");
                    Some(entry)
                }
                Ok(_) | Err(_) => {
                    warn!(pair_id = %pair_id, "Discarding unreadable score cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(subsystem = "cache", pair_id = %pair_id, error = %e, "Score cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, pair_id: &PairId, score: f32, signals: &SignalBreakdown) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let entry = ScoreCacheEntry {
            pair_id: *pair_id,
            score,
            signals: signals.clone(),
            cached_at: Utc::now(),
        };
        let value = match serde_json::to_string(&entry) {
            Ok(v) => v,
            Err(e) => {
                warn!(pair_id = %pair_id, error = %e, "Failed to encode score cache entry");
                return;
            }
        };
        let key = cache_key(&self.tenant_id, KIND, pair_id);
        if let Err(e) = cache.set_ex(&key, &value, self.ttl_secs).await {
            warn!(subsystem = "cache", pair_id = %pair_id, error = %e, "Score cache write failed");
        }
    }

    /// Drop every cached score whose pair contains `concept_id`.
    pub async fn invalidate_concept(&self, concept_id: Uuid) -> u64 {
        let Some(cache) = self.cache.as_ref() else {
            return 0;
        };
        let pattern = concept_pattern(&self.tenant_id, KIND, concept_id);
        match cache.delete_pattern(&pattern).await {
            Ok(n) => n,
            Err(e) => {
                warn!(subsystem = "cache", concept_id = %concept_id, error = %e, "Score cache invalidation failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concord_core::{Error, Result};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapCache {
        entries: Mutex<HashMap<String, String>>,
        failing: bool,
    }

    #[async_trait]
    impl KeyValueCache for MapCache {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            if self.failing {
                return Err(Error::Cache("down".to_string()));
            }
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set_ex(&self, key: &str, value: &str, _ttl: u64) -> Result<()> {
            if self.failing {
                return Err(Error::Cache("down".to_string()));
            }
            self.entries.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }

        async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
            let needle = pattern.trim_end_matches('*').rsplit('*').next().unwrap_or("").to_string();
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|k, _| !k.contains(&needle));
            Ok((before - entries.len()) as u64)
        }
    }

    fn pair() -> PairId {
        PairId::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_key_layout() {
        let p = pair();
        assert_eq!(cache_key("acme", "score", &p), format!("concord:acme:score:{}", p));
        let id = p.low();
        assert_eq!(concept_pattern("acme", "reject", id), format!("concord:acme:reject:*{}*", id));
    }

    #[tokio::test]
    async fn test_put_get_and_invalidate() {
        let cache = ScoreCache::new(Some(Arc::new(MapCache::default())), "t", 60);
        let p = pair();
        let signals = SignalBreakdown {
            lexical_similarity: 0.8,
            ..Default::default()
        };
        assert!(cache.get(&p).await.is_none());
        cache.put(&p, 0.7, &signals).await;
        let hit = cache.get(&p).await.unwrap();
        assert_eq!(hit.signals, signals);
        assert_eq!(cache.invalidate_concept(p.high()).await, 1);
        assert!(cache.get(&p).await.is_none());
    }

    #[tokio::test]
    async fn test_failures_are_misses() {
        let cache = ScoreCache::new(
            Some(Arc::new(MapCache {
                failing: true,
                ..Default::default()
            })),
            "t",
            60,
        );
        let p = pair();
        cache.put(&p, 0.7, &SignalBreakdown::default()).await;
        assert!(cache.get(&p).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_never_hits() {
        let cache = ScoreCache::disabled("t");
        let p = pair();
        cache.put(&p, 0.7, &SignalBreakdown::default()).await;
        assert!(cache.get(&p).await.is_none());
        assert!(!cache.is_enabled());
    }
}
