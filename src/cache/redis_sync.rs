use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::DnsCacheEntry;
use super::expiring_lru::ExpiringLru;
use crate::error::{Result, WardenError};

const CHANNEL: &str = "warden:cache:sync";
const KEY_PREFIX: &str = "warden:cache";

/// One cache insertion travelling over the bus.
#[derive(Debug, Serialize, Deserialize)]
struct SyncMessage {
    /// Sender instance id, for self-dedup.
    instance: u128,
    key: String,
    entry: DnsCacheEntry,
    ttl_secs: u64,
}

/// Optional cache sharing over Redis: every local insertion is published and
/// persisted under `warden:cache:<instance>:<key>`; a subscriber feeds remote
/// insertions straight into the local LRU. Everything is best-effort — Redis
/// being down never fails a query.
pub struct RedisSync {
    client: redis::Client,
    manager: ConnectionManager,
    instance_id: Uuid,
}

impl RedisSync {
    pub async fn connect(addresses: &[String], instance_id: Uuid) -> Result<Self> {
        let address = addresses
            .first()
            .ok_or_else(|| WardenError::Redis("no redis address configured".into()))?;
        let url = if address.starts_with("redis://") || address.starts_with("rediss://") {
            address.clone()
        } else {
            format!("redis://{}", address)
        };
        let client = redis::Client::open(url.as_str())
            .map_err(|e| WardenError::Redis(format!("invalid redis address {}: {}", address, e)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| WardenError::Redis(format!("cannot connect to {}: {}", address, e)))?;
        info!("connected to redis at {}", address);
        Ok(Self { client, manager, instance_id })
    }

    fn redis_key(&self, cache_key: &str) -> String {
        format!("{}:{}:{}", KEY_PREFIX, self.instance_id, cache_key)
    }

    /// Publish a local insertion and persist it with a matching TTL.
    pub async fn publish_put(&self, cache_key: &str, entry: &DnsCacheEntry, ttl: Duration) {
        let message = SyncMessage {
            instance: self.instance_id.as_u128(),
            key: cache_key.to_string(),
            entry: DnsCacheEntry { wire: entry.wire.clone(), rcode: entry.rcode },
            ttl_secs: ttl.as_secs().max(1),
        };
        let payload = match bincode::serialize(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to serialize cache sync message: {}", e);
                return;
            }
        };
        let mut conn = self.manager.clone();
        if let Err(e) = conn.publish::<_, _, ()>(CHANNEL, payload).await {
            warn!("redis publish failed: {}", e);
            return;
        }
        let stored = match bincode::serialize(entry) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("failed to serialize cache entry: {}", e);
                return;
            }
        };
        if let Err(e) = conn
            .set_ex::<_, _, ()>(self.redis_key(cache_key), stored, message.ttl_secs)
            .await
        {
            warn!("redis set failed: {}", e);
        }
    }

    /// Warm the local cache from the shared keyspace on startup.
    pub async fn warm(&self, cache: &Arc<ExpiringLru<DnsCacheEntry>>) -> Result<usize> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}:*", KEY_PREFIX);
        let mut cursor: u64 = 0;
        let mut loaded = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| WardenError::Redis(format!("SCAN failed: {}", e)))?;

            for redis_key in keys {
                let Some(cache_key) = strip_instance_prefix(&redis_key) else {
                    continue;
                };
                let data: Option<Vec<u8>> = conn.get(&redis_key).await.ok().flatten();
                let Some(data) = data else { continue };
                let Ok(entry) = bincode::deserialize::<DnsCacheEntry>(&data) else {
                    debug!("skipping undecodable redis entry {}", redis_key);
                    continue;
                };
                let remaining_ms: i64 = redis::cmd("PTTL")
                    .arg(&redis_key)
                    .query_async(&mut conn)
                    .await
                    .unwrap_or(-1);
                if remaining_ms <= 0 {
                    continue;
                }
                cache.put(cache_key, entry, Duration::from_millis(remaining_ms as u64));
                loaded += 1;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        info!("warmed cache with {} entries from redis", loaded);
        Ok(loaded)
    }

    /// Feed remote insertions into the local cache until cancelled.
    /// Reconnects with a delay after subscription failures.
    pub fn spawn_subscriber(
        self: Arc<Self>,
        cache: Arc<ExpiringLru<DnsCacheEntry>>,
        cancel: CancellationToken,
    ) {
        let sync = self;
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match sync.run_subscription(&cache, &cancel).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("redis subscription lost: {}, retrying in 5s", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                }
            }
            debug!("redis subscriber stopped");
        });
    }

    async fn run_subscription(
        &self,
        cache: &Arc<ExpiringLru<DnsCacheEntry>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| WardenError::Redis(e.to_string()))?;
        pubsub
            .subscribe(CHANNEL)
            .await
            .map_err(|e| WardenError::Redis(e.to_string()))?;
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = stream.next() => {
                    let Some(message) = message else {
                        return Err(WardenError::Redis("subscription stream ended".into()));
                    };
                    let payload: Vec<u8> = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            debug!("undecodable pubsub payload: {}", e);
                            continue;
                        }
                    };
                    let Ok(sync_message) = bincode::deserialize::<SyncMessage>(&payload) else {
                        continue;
                    };
                    if sync_message.instance == self.instance_id.as_u128() {
                        continue;
                    }
                    debug!("applying remote cache entry for {}", sync_message.key);
                    cache.put(
                        &sync_message.key,
                        sync_message.entry,
                        Duration::from_secs(sync_message.ttl_secs),
                    );
                }
            }
        }
    }
}

fn strip_instance_prefix(redis_key: &str) -> Option<&str> {
    redis_key
        .strip_prefix(KEY_PREFIX)?
        .strip_prefix(':')?
        .split_once(':')
        .map(|(_, cache_key)| cache_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_instance_prefix() {
        let key = "warden:cache:8e7a9a3e-0000-0000-0000-1234567890ab:example.com|1|1|default";
        assert_eq!(strip_instance_prefix(key), Some("example.com|1|1|default"));
        assert_eq!(strip_instance_prefix("other:key"), None);
    }
}
