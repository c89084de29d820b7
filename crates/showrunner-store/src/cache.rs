use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// Process-local read cache in front of the authoritative store. Keys are
/// namespaced (`project:{id}`, `project:{id}:shot:{shot_id}`); every entry
/// carries a TTL and writers invalidate through [`DocumentCache::evict_prefix`].
///
/// Enumeration is cursor-based: each scan chunk takes the read lock only
/// for its own slice of the keyspace, so a large deployment never sees a
/// full-keyspace sweep holding other clients out.
#[derive(Clone)]
pub struct DocumentCache {
    entries: Arc<RwLock<BTreeMap<String, CacheEntry>>>,
    ttl: Duration,
}

const SCAN_CHUNK: usize = 64;

impl DocumentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn put(&self, key: impl Into<String>, value: Value) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(key.into(), entry);
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// One cursor step: keys after `cursor` that start with `prefix`, at
    /// most `count` of them. Returns the keys and the cursor for the next
    /// step, `None` once the prefix range is exhausted.
    pub async fn scan(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> (Vec<String>, Option<String>) {
        let entries = self.entries.read().await;
        let range = match cursor {
            Some(c) => entries.range::<str, _>((Bound::Excluded(c), Bound::Unbounded)),
            None => entries.range::<str, _>((Bound::Included(prefix), Bound::Unbounded)),
        };
        let mut keys = Vec::with_capacity(count.min(SCAN_CHUNK));
        for (key, _) in range {
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.clone());
            if keys.len() >= count {
                break;
            }
        }
        let next = if keys.len() >= count {
            keys.last().cloned()
        } else {
            None
        };
        (keys, next)
    }

    /// Evict a key family chunk by chunk via the scan cursor.
    pub async fn evict_prefix(&self, prefix: &str) {
        let mut cursor: Option<String> = None;
        loop {
            let (keys, next) = self.scan(prefix, cursor.as_deref(), SCAN_CHUNK).await;
            if keys.is_empty() {
                break;
            }
            {
                let mut entries = self.entries.write().await;
                for key in &keys {
                    entries.remove(key);
                }
            }
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
    }

    /// Drop entries whose TTL has lapsed. Callers run this opportunistically;
    /// expired entries are already invisible to `get`.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_respects_ttl() {
        let cache = DocumentCache::new(Duration::from_millis(20));
        cache.put("project:P1", json!({"v": 1})).await;
        assert!(cache.get("project:P1").await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("project:P1").await.is_none());
        assert_eq!(cache.sweep_expired().await, 1);
    }

    #[tokio::test]
    async fn scan_walks_prefix_in_chunks() {
        let cache = DocumentCache::new(Duration::from_secs(60));
        for i in 0..10 {
            cache
                .put(format!("project:P1:shot:S{i:02}"), json!(i))
                .await;
        }
        cache.put("project:P2", json!("other")).await;

        let (first, cursor) = cache.scan("project:P1:", None, 4).await;
        assert_eq!(first.len(), 4);
        let (second, cursor) = cache.scan("project:P1:", cursor.as_deref(), 4).await;
        assert_eq!(second.len(), 4);
        let (third, cursor) = cache.scan("project:P1:", cursor.as_deref(), 4).await;
        assert_eq!(third.len(), 2);
        assert!(cursor.is_none());
        assert!(third.iter().all(|k| k.starts_with("project:P1:")));
    }

    #[tokio::test]
    async fn evict_prefix_leaves_other_families() {
        let cache = DocumentCache::new(Duration::from_secs(60));
        for i in 0..100 {
            cache.put(format!("project:P1:shot:S{i:03}"), json!(i)).await;
        }
        cache.put("project:P10", json!("keep")).await;
        cache.evict_prefix("project:P1:").await;
        assert!(cache.get("project:P10").await.is_some());
        assert_eq!(cache.len().await, 1);
    }
}
