use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{NextResolver, Resolver};
use crate::cache::expiring_lru::{CacheHooks, ExpiringLru, ReloadFn};
use crate::cache::redis_sync::RedisSync;
use crate::cache::{DnsCacheEntry, cache_key, parse_cache_key};
use crate::config::CachingConfig;
use crate::dns::DnsMessage;
use crate::dns::enums::Rcode;
use crate::error::{Result, WardenError};
use crate::metrics::Metrics;
use crate::model::{Protocol, Request, Response, ResponseType};

/// Per-key exponentially decayed query counter driving prefetch decisions;
/// the half-life is `prefetchExpires`.
pub struct PrefetchTracker {
    states: DashMap<String, PrefetchState>,
    window: Duration,
    threshold: u32,
    max_items: usize,
}

struct PrefetchState {
    weighted: f64,
    last: Instant,
}

impl PrefetchTracker {
    fn new(config: &CachingConfig) -> Self {
        Self {
            states: DashMap::new(),
            window: config.prefetch_expires.as_duration(),
            threshold: config.prefetch_threshold,
            max_items: config.prefetch_max_items_count,
        }
    }

    fn decay(&self, state: &mut PrefetchState, now: Instant) {
        let elapsed = now.duration_since(state.last).as_secs_f64();
        let half_life = self.window.as_secs_f64().max(0.001);
        state.weighted *= 0.5f64.powf(elapsed / half_life);
        state.last = now;
    }

    /// Record one lookup of `key`. When the tracker is full, new keys are
    /// not admitted; already-hot keys keep counting.
    fn note(&self, key: &str) {
        let now = Instant::now();
        match self.states.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                self.decay(state, now);
                state.weighted += 1.0;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if self.max_items == 0 || self.states.len() < self.max_items {
                    vacant.insert(PrefetchState { weighted: 1.0, last: now });
                }
            }
        }
    }

    /// Whether `key` has been queried often enough to be reloaded on
    /// expiry. A threshold of zero prefetches everything.
    fn should_prefetch(&self, key: &str) -> bool {
        if self.threshold == 0 {
            return true;
        }
        let now = Instant::now();
        match self.states.get_mut(key) {
            Some(mut state) => {
                self.decay(state.value_mut(), now);
                state.weighted >= self.threshold as f64
            }
            None => false,
        }
    }

    fn tracked(&self) -> usize {
        self.states.len()
    }
}

/// Serves repeated questions from the expiring LRU; on a miss the rest of
/// the chain is consulted once per key (single-flight) and the answer is
/// cached under the TTL policy. Optionally prefetches hot keys on expiry
/// and mirrors insertions to Redis.
pub struct CachingResolver {
    enabled: bool,
    min_ttl: Duration,
    max_ttl: Option<Duration>,
    negative_ttl: Duration,
    exclude: Vec<String>,
    cache: Arc<ExpiringLru<DnsCacheEntry>>,
    in_flight: DashMap<String, broadcast::Sender<Result<Response>>>,
    prefetch: Option<Arc<PrefetchTracker>>,
    redis: Option<Arc<RedisSync>>,
    metrics: Arc<Metrics>,
    next: NextResolver,
}

impl CachingResolver {
    /// Build the resolver, start the sweeper and, when Redis is configured,
    /// the warm-up and subscriber tasks.
    pub fn spawn(
        config: &CachingConfig,
        metrics: Arc<Metrics>,
        redis: Option<Arc<RedisSync>>,
        next: NextResolver,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let enabled = !config.max_time.is_negative();
        let prefetch = config
            .prefetching
            .then(|| Arc::new(PrefetchTracker::new(config)));

        let hooks = CacheHooks {
            on_evict: Some({
                let evictions = metrics.cache_evictions.clone();
                Arc::new(move |_| evictions.inc())
            }),
            on_after_put: Some({
                let entries = metrics.cache_entries.clone();
                Arc::new(move |len| entries.set(len as i64))
            }),
            ..CacheHooks::default()
        };

        let mut cache = ExpiringLru::new(
            config.max_items_count,
            config.clean_up_interval.as_duration(),
        )
        .with_hooks(hooks);

        if let Some(tracker) = &prefetch {
            cache = cache.with_reload(Self::reload_fn(
                config,
                tracker.clone(),
                next.clone(),
                metrics.clone(),
                cancel.clone(),
            ));
        }
        let cache = Arc::new(cache);
        if enabled {
            cache.clone().spawn_sweeper(cancel.clone());
        }

        let resolver = Arc::new(Self {
            enabled,
            min_ttl: config.min_time.as_duration(),
            max_ttl: (!config.max_time.is_negative() && !config.max_time.is_zero())
                .then(|| config.max_time.as_duration()),
            negative_ttl: config.cache_time_negative.as_duration(),
            exclude: config.exclude.iter().map(|s| s.trim_matches('.').to_lowercase()).collect(),
            cache: cache.clone(),
            in_flight: DashMap::new(),
            prefetch,
            redis: resolver_redis(&redis, enabled),
            metrics,
            next,
        });

        if let Some(redis) = &resolver.redis {
            redis.clone().spawn_subscriber(cache.clone(), cancel.clone());
            let warm_redis = redis.clone();
            let warm_cache = cache;
            tokio::spawn(async move {
                if let Err(e) = warm_redis.warm(&warm_cache).await {
                    warn!("redis cache warm-up failed: {}", e);
                }
            });
        }
        resolver
    }

    /// The sweeper's `OnExpired` hook: reload hot keys through the rest of
    /// the chain, drop everything else.
    fn reload_fn(
        config: &CachingConfig,
        tracker: Arc<PrefetchTracker>,
        next: NextResolver,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> ReloadFn<DnsCacheEntry> {
        let policy = TtlPolicy::from_config(config);
        Arc::new(move |key: String| {
            let tracker = tracker.clone();
            let next = next.clone();
            let metrics = metrics.clone();
            let cancel = cancel.clone();
            async move {
                metrics.prefetch_domains.set(tracker.tracked() as i64);
                if !tracker.should_prefetch(&key) {
                    return None;
                }
                let (question, group) = parse_cache_key(&key)?;
                trace!("prefetching {}", key);

                let mut message = DnsMessage::new_query(question.name, question.qtype);
                message.questions[0].qclass = question.qclass;
                let mut request =
                    Request::new(message, std::net::Ipv4Addr::UNSPECIFIED.into(), Protocol::Udp)
                        .with_cancel(cancel.child_token());
                request.client_group = group;

                match next.resolve(&mut request).await {
                    Ok(response) => {
                        let ttl = policy.effective_ttl(&response.message)?;
                        let entry = prepare_entry(&response.message, ttl).ok()?;
                        metrics.prefetches.inc();
                        Some((entry, ttl))
                    }
                    Err(e) => {
                        debug!("prefetch of {} failed: {}", key, e);
                        None
                    }
                }
            }
            .boxed()
        })
    }

    fn is_excluded(&self, qname: &str) -> bool {
        let qname = qname.to_lowercase();
        self.exclude
            .iter()
            .any(|suffix| qname == *suffix || qname.ends_with(&format!(".{}", suffix)))
    }

    fn serve_hit(&self, request: &Request, entry: DnsCacheEntry, remaining: Duration) -> Result<Response> {
        let mut message = entry.to_message()?;
        message.set_id(request.message.id());
        message.header.ra = true;
        message.set_ttls(remaining.as_secs() as u32);
        Ok(Response::new(message, ResponseType::Cached, "served from cache"))
    }

    async fn resolve_and_store(&self, request: &mut Request, key: &str) -> Result<Response> {
        let outcome = self.next.resolve(request).await;
        if let Ok(response) = &outcome {
            let policy = TtlPolicy {
                min: self.min_ttl,
                max: self.max_ttl,
                negative: self.negative_ttl,
            };
            if let Some(ttl) = policy.effective_ttl(&response.message) {
                if let Ok(entry) = prepare_entry(&response.message, ttl) {
                    self.cache.put(key, entry.clone(), ttl);
                    if let Some(redis) = &self.redis {
                        let redis = redis.clone();
                        let key = key.to_string();
                        tokio::spawn(async move {
                            redis.publish_put(&key, &entry, ttl).await;
                        });
                    }
                }
            }
        }
        outcome
    }
}

fn resolver_redis(redis: &Option<Arc<RedisSync>>, enabled: bool) -> Option<Arc<RedisSync>> {
    if enabled { redis.clone() } else { None }
}

#[derive(Clone, Copy)]
struct TtlPolicy {
    min: Duration,
    max: Option<Duration>,
    negative: Duration,
}

impl TtlPolicy {
    fn from_config(config: &CachingConfig) -> Self {
        Self {
            min: config.min_time.as_duration(),
            max: (!config.max_time.is_negative() && !config.max_time.is_zero())
                .then(|| config.max_time.as_duration()),
            negative: config.cache_time_negative.as_duration(),
        }
    }

    /// TTL a response is cached under, or `None` for uncacheable responses.
    fn effective_ttl(&self, message: &DnsMessage) -> Option<Duration> {
        match message.rcode() {
            Rcode::NoError if !message.answers.is_empty() => {
                let upstream_ttl =
                    Duration::from_secs(u64::from(message.min_answer_ttl().unwrap_or(0)));
                let mut ttl = upstream_ttl.max(self.min);
                if let Some(max) = self.max {
                    ttl = ttl.min(max);
                }
                Some(ttl)
            }
            Rcode::NoError | Rcode::NxDomain => Some(self.negative),
            _ => None,
        }
    }
}

/// Pack a response for storage with its TTLs rewritten to the effective
/// value, so a later hit only has to subtract the elapsed time.
fn prepare_entry(message: &DnsMessage, ttl: Duration) -> Result<DnsCacheEntry> {
    let mut stored = message.clone();
    stored.set_id(0);
    stored.set_ttls(ttl.as_secs() as u32);
    DnsCacheEntry::from_message(&stored)
}

#[async_trait]
impl Resolver for CachingResolver {
    fn name(&self) -> &'static str {
        "caching"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        if !self.enabled {
            return self.next.resolve(request).await;
        }
        let Some(question) = request.message.question().cloned() else {
            return self.next.resolve(request).await;
        };
        if self.is_excluded(&question.name) {
            trace!("{} is excluded from caching", question.name);
            return self.next.resolve(request).await;
        }

        let key = cache_key(&question, &request.client_group);
        if let Some(tracker) = &self.prefetch {
            tracker.note(&key);
            self.metrics.prefetch_domains.set(tracker.tracked() as i64);
        }

        if let Some((entry, remaining)) = self.cache.get(&key) {
            self.metrics.cache_hits.inc();
            debug!("cache hit for {} ({}s left)", key, remaining.as_secs());
            return self.serve_hit(request, entry, remaining);
        }
        self.metrics.cache_misses.inc();

        // Single-flight: the first caller per key resolves, the rest join.
        let waiter = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => Some(occupied.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (tx, _) = broadcast::channel(1);
                vacant.insert(tx);
                None
            }
        };

        if let Some(mut receiver) = waiter {
            trace!("joining in-flight lookup for {}", key);
            return match receiver.recv().await {
                Ok(shared) => shared.map(|mut response| {
                    response.message.set_id(request.message.id());
                    response
                }),
                // The leader vanished without publishing (e.g. cancelled):
                // fall back to resolving ourselves.
                Err(_) => self.resolve_and_store(request, &key).await,
            };
        }

        // If this task is dropped mid-resolve, the guard clears the entry so
        // waiters fall back to resolving themselves instead of hanging.
        let mut guard = FlightGuard { map: &self.in_flight, key: key.clone(), armed: true };
        let outcome = self.resolve_and_store(request, &key).await;
        guard.armed = false;
        if let Some((_, sender)) = self.in_flight.remove(&key) {
            // A cancellation belongs to the leader's request only; dropping
            // the sender sends the waiters down their fallback path.
            if !matches!(&outcome, Err(WardenError::Cancelled)) {
                let shared = match &outcome {
                    Ok(response) => Ok(response.clone()),
                    Err(e) => Err(e.clone()),
                };
                let _ = sender.send(shared);
            }
        }
        outcome
    }
}

struct FlightGuard<'a> {
    map: &'a DashMap<String, broadcast::Sender<Result<Response>>>,
    key: String,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.map.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignedDuration;
    use crate::dns::enums::RecordType;
    use crate::resolver::test_support::{StaticResolver, request_for};

    fn spawn_caching(config: &CachingConfig, next: NextResolver) -> Arc<CachingResolver> {
        CachingResolver::spawn(
            config,
            Arc::new(Metrics::new().unwrap()),
            None,
            next,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let inner = StaticResolver::with_ttl("1.2.3.4", 123).arc();
        let caching = spawn_caching(&CachingConfig::default(), inner.clone());

        let mut request = request_for("google.com", RecordType::A);
        let first = caching.resolve(&mut request).await.unwrap();
        assert_eq!(first.response_type, ResponseType::Resolved);
        assert_eq!(first.message.answers[0].ttl, 123);

        let mut request = request_for("google.com", RecordType::A);
        let second = caching.resolve(&mut request).await.unwrap();
        assert_eq!(second.response_type, ResponseType::Cached);
        assert!(second.message.answers[0].ttl <= 123);
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn cached_response_keeps_request_id() {
        let caching = spawn_caching(&CachingConfig::default(), StaticResolver::resolved("1.2.3.4").arc());
        let mut request = request_for("example.com", RecordType::A);
        caching.resolve(&mut request).await.unwrap();

        let mut request = request_for("example.com", RecordType::A);
        request.message.set_id(4242);
        let hit = caching.resolve(&mut request).await.unwrap();
        assert_eq!(hit.message.id(), 4242);
    }

    #[tokio::test]
    async fn negative_responses_use_negative_ttl() {
        let config = CachingConfig {
            cache_time_negative: crate::config::DurationSetting::from_secs(1800),
            ..CachingConfig::default()
        };
        let inner = StaticResolver::nxdomain().arc();
        let caching = spawn_caching(&config, inner.clone());

        let mut request = request_for("nope.example.com", RecordType::A);
        caching.resolve(&mut request).await.unwrap();
        let mut request = request_for("nope.example.com", RecordType::A);
        let second = caching.resolve(&mut request).await.unwrap();
        assert_eq!(second.response_type, ResponseType::Cached);
        assert_eq!(second.message.rcode(), Rcode::NxDomain);
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn servfail_is_never_cached() {
        let inner = StaticResolver::servfail().arc();
        let caching = spawn_caching(&CachingConfig::default(), inner.clone());
        for _ in 0..3 {
            let mut request = request_for("flaky.example.com", RecordType::A);
            let response = caching.resolve(&mut request).await.unwrap();
            assert_eq!(response.response_type, ResponseType::Resolved);
        }
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn negative_max_time_disables_the_cache() {
        let config = CachingConfig { max_time: SignedDuration(-1), ..CachingConfig::default() };
        let inner = StaticResolver::resolved("1.2.3.4").arc();
        let caching = spawn_caching(&config, inner.clone());
        for _ in 0..3 {
            let mut request = request_for("example.com", RecordType::A);
            let response = caching.resolve(&mut request).await.unwrap();
            assert_ne!(response.response_type, ResponseType::Cached);
        }
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn ttl_clamping() {
        let policy = TtlPolicy {
            min: Duration::from_secs(60),
            max: Some(Duration::from_secs(300)),
            negative: Duration::from_secs(30),
        };
        let query = DnsMessage::new_query("example.com", RecordType::A);
        let mut response = DnsMessage::response_for(&query);
        response.answers.push(crate::dns::ResourceRecord::a(
            "example.com",
            10,
            "1.2.3.4".parse().unwrap(),
        ));
        assert_eq!(policy.effective_ttl(&response), Some(Duration::from_secs(60)));
        response.answers[0].ttl = 9000;
        assert_eq!(policy.effective_ttl(&response), Some(Duration::from_secs(300)));
        response.answers[0].ttl = 120;
        assert_eq!(policy.effective_ttl(&response), Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn max_time_zero_respects_upstream_ttl() {
        let policy = TtlPolicy { min: Duration::ZERO, max: None, negative: Duration::from_secs(30) };
        let query = DnsMessage::new_query("example.com", RecordType::A);
        let mut response = DnsMessage::response_for(&query);
        response.answers.push(crate::dns::ResourceRecord::a(
            "example.com",
            86400,
            "1.2.3.4".parse().unwrap(),
        ));
        assert_eq!(policy.effective_ttl(&response), Some(Duration::from_secs(86400)));
    }

    #[tokio::test]
    async fn excluded_suffixes_bypass_the_cache() {
        let config = CachingConfig { exclude: vec!["internal.example.com".to_string()], ..CachingConfig::default() };
        let inner = StaticResolver::resolved("1.2.3.4").arc();
        let caching = spawn_caching(&config, inner.clone());
        for _ in 0..2 {
            let mut request = request_for("db.internal.example.com", RecordType::A);
            let response = caching.resolve(&mut request).await.unwrap();
            assert_eq!(response.response_type, ResponseType::Resolved);
        }
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_lookups() {
        let inner = StaticResolver::resolved("1.2.3.4").arc();
        let caching = spawn_caching(&CachingConfig::default(), inner.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let caching = caching.clone();
            handles.push(tokio::spawn(async move {
                let mut request = request_for("example.com", RecordType::A);
                caching.resolve(&mut request).await.unwrap()
            }));
        }
        for handle in handles {
            let response = handle.await.unwrap();
            assert_eq!(response.message.answers[0].rdata.ip().unwrap().to_string(), "1.2.3.4");
        }
        // The StaticResolver answers instantly, so coalescing is
        // opportunistic; it must never resolve more than once per caller.
        assert!(inner.calls() <= 8);
    }

    #[tokio::test]
    async fn prefetch_reloads_hot_keys_after_expiry() {
        let config = CachingConfig {
            prefetching: true,
            prefetch_threshold: 2,
            prefetch_expires: crate::config::DurationSetting(Duration::from_secs(2)),
            min_time: crate::config::DurationSetting(Duration::from_millis(50)),
            max_time: SignedDuration(50),
            clean_up_interval: crate::config::DurationSetting(Duration::from_millis(100)),
            ..CachingConfig::default()
        };
        let inner = StaticResolver::with_ttl("1.2.3.4", 1).arc();
        let caching = spawn_caching(&config, inner.clone());

        for _ in 0..3 {
            let mut request = request_for("hot.example.com", RecordType::A);
            caching.resolve(&mut request).await.unwrap();
        }
        let calls_before_expiry = inner.calls();
        assert_eq!(calls_before_expiry, 1);

        // Entry (50ms cap) expires; the sweeper must reload it through the
        // inner resolver rather than dropping it.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(inner.calls() > calls_before_expiry, "prefetch reloaded the entry");

        let mut request = request_for("hot.example.com", RecordType::A);
        let response = caching.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Cached);
    }

    #[tokio::test]
    async fn prefetch_threshold_zero_always_fires() {
        let tracker = PrefetchTracker::new(&CachingConfig {
            prefetching: true,
            prefetch_threshold: 0,
            ..CachingConfig::default()
        });
        assert!(tracker.should_prefetch("never-seen-key"));
    }
}
