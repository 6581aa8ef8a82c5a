//! Short-lived local cache.
//!
//! A generic key/value store where every entry carries its own expiry. Reads
//! of expired entries behave like misses; a background sweeper removes
//! expired entries so idle keys don't accumulate. Absence is never an error.
//!
//! The cache is cheap to clone (clones share the same storage) and is
//! internally synchronized.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// TTL key/value store.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: Arc<Mutex<HashMap<K, Entry<V>>>>,
    default_ttl: Duration,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates an empty cache whose `set_default` uses `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the value for `key` if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores `value` under `key` for `ttl`.
    ///
    /// A zero TTL is treated as "don't cache" and removes any existing entry.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if ttl.is_zero() {
            entries.remove(&key);
            return;
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Stores `value` under `key` with the default TTL.
    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Stores `value` with the default TTL unless a larger live value is
    /// already cached. Keeps monotonic values monotonic under racing writers.
    pub fn set_max(&self, key: K, value: V)
    where
        V: Ord,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = entries.get(&key) {
            if entry.expires_at > now && entry.value >= value {
                return;
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.default_ttl,
            },
        );
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Spawns the background sweeper.
    ///
    /// Runs `purge_expired` every `every` until `cancel` fires.
    pub fn spawn_sweeper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Cache sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, remaining = cache.len(), "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_before_and_after_expiry() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(60));
        cache.set("a".to_string(), 1, Duration::from_secs(5));

        assert_eq!(cache.get(&"a".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_independently() {
        let cache: TtlCache<&'static str, u64> = TtlCache::new(Duration::from_secs(60));
        cache.set("short", 1, Duration::from_secs(1));
        cache.set_default("long", 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"short"), None);
        assert_eq!(cache.get(&"long"), Some(2));
    }

    #[tokio::test]
    async fn test_set_max_never_lowers_live_value() {
        let cache: TtlCache<&str, u64> = TtlCache::new(Duration::from_secs(60));

        cache.set_max("k", 5);
        cache.set_max("k", 3);
        assert_eq!(cache.get(&"k"), Some(5));

        cache.set_max("k", 8);
        assert_eq!(cache.get(&"k"), Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_max_replaces_expired_value() {
        let cache: TtlCache<&str, u64> = TtlCache::new(Duration::from_secs(1));

        cache.set_max("k", 5);
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.set_max("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_removes() {
        let cache: TtlCache<&'static str, u64> = TtlCache::new(Duration::from_secs(60));
        cache.set_default("k", 1);
        cache.set("k", 2, Duration::ZERO);
        assert_eq!(cache.get(&"k"), None);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let cache: TtlCache<&'static str, u64> = TtlCache::new(Duration::from_secs(60));
        let other = cache.clone();
        cache.set_default("k", 9);
        assert_eq!(other.get(&"k"), Some(9));
        assert_eq!(other.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let cache: TtlCache<&'static str, u64> = TtlCache::new(Duration::from_secs(60));
        cache.set("a", 1, Duration::from_secs(1));
        cache.set("b", 2, Duration::from_secs(1));

        let cancel = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(Duration::from_secs(10), cancel.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.len(), 0);

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
