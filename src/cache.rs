//! Key/value cache backend used for permission sets, 2FA rate-limit counters
//! and trusted devices.
//!
//! [`CacheStore`] is the narrow interface the core depends on. [`MemoryCache`]
//! is the in-process implementation: an LRU bounded by entry count with
//! per-entry expiry. Keys under [`PINNED_PREFIXES`] hold security state and
//! are never evicted for capacity; they leave only by expiry or deletion.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cached value for '{key}' is not a counter")]
    NotACounter { key: String },
    #[error("failed to (de)serialize cached value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub value: u64,
    /// Time until the counter's window closes.
    pub ttl_remaining: Duration,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), CacheError>;

    /// Increment the counter at `key`. The expiry is set only when the
    /// increment creates the key, so the window is anchored at the first hit.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<Counter, CacheError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove every key matching a `*` glob. Returns the number removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError>;

    /// List live keys matching a `*` glob.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// 2FA attempt counters and single-use challenge markers. Evicting either
/// would reset a rate limit or re-open a spent challenge.
pub const PINNED_PREFIXES: &[&str] = &["2fa_attempts:", "2fa_challenge_used:"];

fn is_pinned(key: &str) -> bool {
    PINNED_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

struct Entries {
    lru: LruCache<String, Entry>,
    pinned: HashMap<String, Entry>,
}

impl Entries {
    fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        if is_pinned(key) {
            self.pinned.get_mut(key)
        } else {
            self.lru.get_mut(key)
        }
    }

    fn put(&mut self, key: String, entry: Entry, now: Instant) {
        if is_pinned(&key) {
            if self.pinned.len() >= self.lru.cap().get() {
                self.pinned.retain(|_, e| e.is_live(now));
            }
            self.pinned.insert(key, entry);
        } else {
            self.lru.put(key, entry);
        }
    }

    fn pop(&mut self, key: &str) -> Option<Entry> {
        if is_pinned(key) {
            self.pinned.remove(key)
        } else {
            self.lru.pop(key)
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.lru.iter().chain(self.pinned.iter())
    }
}

pub struct MemoryCache {
    entries: Mutex<Entries>,
}

impl MemoryCache {
    /// `capacity` bounds the evictable keys; pinned keys are not counted.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(Entries {
                lru: LruCache::new(capacity),
                pinned: HashMap::new(),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.iter().filter(|(_, e)| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let live = entries
            .get_mut(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.put(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
            now,
        );
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<Counter, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(key)
            && entry.is_live(now)
        {
            let current: u64 = entry.value.parse().map_err(|_| CacheError::NotACounter {
                key: key.to_string(),
            })?;
            let value = current.saturating_add(1);
            entry.value = value.to_string();
            return Ok(Counter {
                value,
                ttl_remaining: entry.expires_at.saturating_duration_since(now),
            });
        }

        entries.put(
            key.to_string(),
            Entry {
                value: "1".to_string(),
                expires_at: now + ttl,
            },
            now,
        );
        Ok(Counter {
            value: 1,
            ttl_remaining: ttl,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(entries.pop(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().await;
        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matching {
            entries.pop(key);
        }
        Ok(matching.len() as u64)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Match `key` against a pattern where `*` matches any run of characters.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let remaining: Vec<&str> = parts.collect();
    let Some((last, middle)) = remaining.split_last() else {
        // No wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("perm:t1:*", "perm:t1:u1"));
        assert!(!glob_match("perm:t1:*", "perm:t2:u1"));
        assert!(glob_match("trusted_device:t:u:*", "trusted_device:t:u:abc"));
        assert!(glob_match("*:u1", "perm:t1:u1"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxcyyb"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("*", "anything"));
    }

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let cache = MemoryCache::new(16);
        cache
            .set_with_ttl("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_keeps_window_anchor() {
        let cache = MemoryCache::new(16);
        let ttl = Duration::from_secs(900);

        let first = cache.incr_with_expiry("c", ttl).await.unwrap();
        assert_eq!(first.value, 1);

        let second = cache.incr_with_expiry("c", ttl).await.unwrap();
        assert_eq!(second.value, 2);
        assert!(second.ttl_remaining <= first.ttl_remaining);
    }

    #[tokio::test]
    async fn test_incr_restarts_after_window() {
        let cache = MemoryCache::new(16);
        let ttl = Duration::from_millis(20);
        cache.incr_with_expiry("c", ttl).await.unwrap();
        cache.incr_with_expiry("c", ttl).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap().value, 1);
    }

    #[tokio::test]
    async fn test_incr_on_non_counter_fails() {
        let cache = MemoryCache::new(16);
        cache
            .set_with_ttl("k", "text", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            cache.incr_with_expiry("k", Duration::from_secs(60)).await,
            Err(CacheError::NotACounter { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_pattern_and_scan() {
        let cache = MemoryCache::new(16);
        let ttl = Duration::from_secs(60);
        cache.set_with_ttl("perm:a:1", "[]", ttl).await.unwrap();
        cache.set_with_ttl("perm:a:2", "[]", ttl).await.unwrap();
        cache.set_with_ttl("perm:b:1", "[]", ttl).await.unwrap();

        assert_eq!(
            cache.scan("perm:a:*").await.unwrap(),
            vec!["perm:a:1".to_string(), "perm:a:2".to_string()]
        );
        assert_eq!(cache.delete_pattern("perm:a:*").await.unwrap(), 2);
        assert_eq!(cache.scan("perm:*").await.unwrap(), vec!["perm:b:1"]);
        assert!(cache.delete("perm:b:1").await.unwrap());
        assert!(!cache.delete("perm:b:1").await.unwrap());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set_with_ttl("a", "1", ttl).await.unwrap();
        cache.set_with_ttl("b", "2", ttl).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set_with_ttl("c", "3", ttl).await.unwrap();

        assert!(cache.get("b").await.unwrap().is_none());
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_security_keys_survive_capacity_pressure() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.incr_with_expiry("2fa_attempts:t:u", ttl).await.unwrap();
        cache.incr_with_expiry("2fa_attempts:t:u", ttl).await.unwrap();
        cache
            .set_with_ttl("2fa_challenge_used:jti", "1", ttl)
            .await
            .unwrap();

        for i in 0..10 {
            cache
                .set_with_ttl(&format!("perm:t:{i}"), "[]", ttl)
                .await
                .unwrap();
        }

        assert_eq!(
            cache
                .incr_with_expiry("2fa_attempts:t:u", ttl)
                .await
                .unwrap()
                .value,
            3
        );
        assert!(cache.get("2fa_challenge_used:jti").await.unwrap().is_some());
        assert_eq!(cache.scan("perm:*").await.unwrap().len(), 2);
        assert_eq!(cache.delete_pattern("2fa_*").await.unwrap(), 2);
    }
}
