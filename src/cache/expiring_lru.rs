use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use lru::LruCache;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Callback consulted for every expired key during a sweep. Returning a new
/// value and a positive TTL reinserts the entry, `None` drops it.
pub type ReloadFn<V> =
    Arc<dyn Fn(String) -> BoxFuture<'static, Option<(V, Duration)>> + Send + Sync>;

type KeyHook = Arc<dyn Fn(&str) + Send + Sync>;
type SizeHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Optional observability hooks.
#[derive(Clone, Default)]
pub struct CacheHooks {
    pub on_hit: Option<KeyHook>,
    pub on_miss: Option<KeyHook>,
    pub on_evict: Option<KeyHook>,
    pub on_after_put: Option<SizeHook>,
}

struct ExpiringEntry<V> {
    value: V,
    expires_at: Instant,
    hits: u64,
}

/// Bounded string-keyed container with absolute expiry per entry.
///
/// Eviction is least-recently-used on insertion overflow. Expired entries
/// stay readable (with a remaining TTL of zero) until the background sweeper
/// removes or reloads them.
pub struct ExpiringLru<V> {
    entries: Mutex<LruCache<String, ExpiringEntry<V>>>,
    clean_up_interval: Duration,
    reload: Option<ReloadFn<V>>,
    hooks: CacheHooks,
}

impl<V: Clone + Send + 'static> ExpiringLru<V> {
    pub fn new(max_size: usize, clean_up_interval: Duration) -> Self {
        let entries = match NonZeroUsize::new(max_size) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            clean_up_interval,
            reload: None,
            hooks: CacheHooks::default(),
        }
    }

    pub fn with_reload(mut self, reload: ReloadFn<V>) -> Self {
        self.reload = Some(reload);
        self
    }

    pub fn with_hooks(mut self, hooks: CacheHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Insert `value` under `key`. A zero TTL is a no-op: the entry would be
    /// born expired.
    pub fn put(&self, key: &str, value: V, ttl: Duration) {
        if ttl.is_zero() {
            trace!("discarding put for {} with zero ttl", key);
            return;
        }
        let entry = ExpiringEntry { value, expires_at: Instant::now() + ttl, hits: 0 };
        let len = {
            let mut entries = self.entries.lock();
            if let Some((evicted_key, _)) = entries.push(key.to_string(), entry) {
                if evicted_key != key {
                    if let Some(on_evict) = &self.hooks.on_evict {
                        on_evict(&evicted_key);
                    }
                }
            }
            entries.len()
        };
        if let Some(on_after_put) = &self.hooks.on_after_put {
            on_after_put(len);
        }
    }

    /// Look up `key`, promoting it. Returns the value and its remaining TTL;
    /// an entry past its expiry is still returned with a remaining TTL of
    /// zero until the sweeper has processed it.
    pub fn get(&self, key: &str) -> Option<(V, Duration)> {
        let now = Instant::now();
        let result = {
            let mut entries = self.entries.lock();
            entries.get_mut(key).map(|entry| {
                entry.hits += 1;
                (entry.value.clone(), entry.expires_at.saturating_duration_since(now))
            })
        };
        match (&result, &self.hooks) {
            (Some(_), CacheHooks { on_hit: Some(hook), .. }) => hook(key),
            (None, CacheHooks { on_miss: Some(hook), .. }) => hook(key),
            _ => {}
        }
        result
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.lock().pop(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of recorded hits for `key`, without promoting it.
    pub fn hit_count(&self, key: &str) -> u64 {
        self.entries.lock().peek(key).map(|e| e.hits).unwrap_or(0)
    }

    /// Run the periodic sweeper until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(cache.clean_up_interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cache sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => cache.sweep().await,
                }
            }
        });
    }

    /// One sweep pass. Expired keys are collected under the lock, the lock
    /// is released, reloads run, then removals/reinsertions are applied
    /// under the lock again so the hot path never waits on a reload.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        trace!("sweeping {} expired cache entries", expired.len());

        for key in expired {
            let reloaded = match &self.reload {
                Some(reload) => reload(key.clone()).await,
                None => None,
            };
            match reloaded {
                Some((value, ttl)) if !ttl.is_zero() => {
                    let mut entries = self.entries.lock();
                    entries.push(
                        key,
                        ExpiringEntry { value, expires_at: Instant::now() + ttl, hits: 0 },
                    );
                }
                _ => {
                    self.entries.lock().pop(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn put_get_roundtrip() {
        let cache: ExpiringLru<u32> = ExpiringLru::new(8, Duration::from_secs(1));
        cache.put("a", 1, Duration::from_secs(60));
        let (value, remaining) = cache.get("a").unwrap();
        assert_eq!(value, 1);
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(58));
    }

    #[tokio::test]
    async fn zero_ttl_put_is_noop() {
        let cache: ExpiringLru<u32> = ExpiringLru::new(8, Duration::from_secs(1));
        cache.put("a", 1, Duration::ZERO);
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn lru_eviction_on_overflow() {
        let cache: ExpiringLru<u32> = ExpiringLru::new(2, Duration::from_secs(1));
        cache.put("a", 1, Duration::from_secs(60));
        cache.put("b", 2, Duration::from_secs(60));
        cache.get("a");
        cache.put("c", 3, Duration::from_secs(60));
        assert!(cache.get("b").is_none(), "least recently used entry is evicted");
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn expired_entry_reads_with_zero_ttl_until_swept() {
        let cache: ExpiringLru<u32> = ExpiringLru::new(8, Duration::from_secs(1));
        cache.put("a", 1, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (_, remaining) = cache.get("a").unwrap();
        assert_eq!(remaining, Duration::ZERO);
        cache.sweep().await;
        assert!(cache.get("a").is_none());
    }

    #[tokio::test]
    async fn sweeper_reloads_via_callback() {
        let reload: ReloadFn<u32> = Arc::new(|_key| {
            Box::pin(async move { Some((42u32, Duration::from_secs(60))) })
        });
        let cache = ExpiringLru::new(8, Duration::from_secs(1)).with_reload(reload);
        cache.put("a", 1, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.sweep().await;
        let (value, remaining) = cache.get("a").unwrap();
        assert_eq!(value, 42);
        assert!(remaining > Duration::from_secs(58));
    }

    #[tokio::test]
    async fn hooks_fire() {
        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let misses_clone = misses.clone();
        let cache: ExpiringLru<u32> = ExpiringLru::new(8, Duration::from_secs(1)).with_hooks(CacheHooks {
            on_hit: Some(Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })),
            on_miss: Some(Arc::new(move |_| {
                misses_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..CacheHooks::default()
        });
        cache.put("a", 1, Duration::from_secs(60));
        cache.get("a");
        cache.get("nope");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(misses.load(Ordering::SeqCst), 1);
    }
}
