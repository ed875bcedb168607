//! Hot cache: client trait, JSON helpers and an in-memory TTL implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::StoreError;

/// Key/value cache with optional per-key expiry.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value`; `ttl == None` keeps it until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Enumerate live keys matching a glob (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn health(&self) -> Result<(), StoreError>;

    async fn close(&self);
}

impl dyn CacheClient {
    /// Fetch and decode a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and store a JSON value.
    pub async fn set_json<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Concurrent in-process cache. Expired entries are dropped lazily.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    closed: Arc<AtomicBool>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Remaining time-to-live of a key, if it has one.
    #[cfg(test)]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        let at = entry.expires_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.live_value(key).is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        self.purge_expired();
        let matcher = glob_to_regex(pattern)?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.ensure_open()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
    }
}

/// Translate a Redis-style glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');
    Regex::new(&expr).map_err(|e| StoreError::InvalidTag(format!("bad key pattern {}: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio_test::assert_err;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        rx: f64,
        tx: f64,
    }

    #[tokio::test]
    async fn test_set_get_exists_delete() {
        let cache = MemoryCache::new();
        cache.set("device:status:1", "online", None).await.unwrap();

        assert_eq!(
            cache.get("device:status:1").await.unwrap().as_deref(),
            Some("online")
        );
        assert!(cache.exists("device:status:1").await.unwrap());
        assert_eq!(
            cache
                .delete(&["device:status:1".to_string(), "missing".to_string()])
                .await
                .unwrap(),
            1
        );
        assert!(!cache.exists("device:status:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set("short", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        cache.set("long", "v", Some(Duration::from_secs(3600))).await.unwrap();
        assert!(cache.ttl("long").unwrap() > Duration::from_secs(3500));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert!(cache.exists("long").await.unwrap());
        assert_eq!(cache.keys("*").await.unwrap(), vec!["long".to_string()]);
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let cache = MemoryCache::new();
        for key in [
            "device:bandwidth:1",
            "device:bandwidth:1:ether1",
            "device:bandwidth:1:ether2",
            "device:bandwidth:10:ether1",
            "device:ping:1:8.8.8.8",
        ] {
            cache.set(key, "{}", None).await.unwrap();
        }

        let keys = cache.keys("device:bandwidth:1:*").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "device:bandwidth:1:ether1".to_string(),
                "device:bandwidth:1:ether2".to_string()
            ]
        );
        // dots in the pattern are literal
        assert_eq!(cache.keys("device:ping:1:8?8.8.8").await.unwrap().len(), 1);
        assert!(cache.keys("device:ping:1:8x8x8x8").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache: Arc<dyn CacheClient> = Arc::new(MemoryCache::new());
        let snap = Snapshot { rx: 1.5, tx: 2.5 };
        cache.set_json("device:bandwidth:1", &snap, None).await.unwrap();

        let back: Option<Snapshot> = cache.get_json("device:bandwidth:1").await.unwrap();
        assert_eq!(back, Some(snap));
        let missing: Option<Snapshot> = cache.get_json("nope").await.unwrap();
        assert!(missing.is_none());

        cache.set("bad", "not json", None).await.unwrap();
        assert_err!(cache.get_json::<Snapshot>("bad").await);
    }

    #[tokio::test]
    async fn test_closed_cache_rejects_calls() {
        let cache = MemoryCache::new();
        cache.close().await;
        assert!(matches!(cache.get("x").await, Err(StoreError::Closed)));
        assert_err!(cache.health().await);
    }
}
