//! Read-through subscription cache over Redis.
//!
//! Keys:
//! - `subscription:{id}` — cached record JSON with an embedded
//!   `_cache_version` stamp
//! - `subscription:version:{id}` — the stamp on its own, with twice the TTL
//! - `subscription:global_version` — monotonic counter bumped on every
//!   mutation, a fallback signal for subscribers that missed a pub/sub
//!   message
//!
//! Invalidations fan out on the `subscription:updates` channel; every
//! replica runs a listener that deletes its two keys per received id.
//!
//! Every operation is fail-open: a Redis error degrades to a cache miss
//! (or a no-op for writes) and the caller proceeds against Postgres.

use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{CacheConfig, RedisConfig};
use crate::db::models::Subscription;
use crate::types::SubscriptionId;

/// Pub/sub channel carrying invalidation messages.
pub const UPDATE_CHANNEL: &str = "subscription:updates";

/// Monotonic counter key bumped on every subscription mutation.
pub const GLOBAL_VERSION_KEY: &str = "subscription:global_version";

/// Delay before the invalidation listener restarts after a disconnect.
const LISTENER_RESTART_DELAY: Duration = Duration::from_secs(5);

fn data_key(id: &SubscriptionId) -> String {
    format!("subscription:{id}")
}

fn version_key(id: &SubscriptionId) -> String {
    format!("subscription:version:{id}")
}

/// Wire format of a cached subscription: the record plus a version stamp
/// that must match the standalone version key to be trusted.
#[derive(Debug, Serialize, Deserialize)]
struct CachedSubscription {
    #[serde(flatten)]
    record: Subscription,
    _cache_version: i64,
}

/// Invalidation message published on [`UPDATE_CHANNEL`].
#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub action: String,
    pub subscription_id: SubscriptionId,
    pub timestamp: i64,
}

impl InvalidationMessage {
    fn invalidate(subscription_id: SubscriptionId, timestamp: i64) -> Self {
        Self {
            action: "invalidate".to_string(),
            subscription_id,
            timestamp,
        }
    }
}

/// Shared, cloneable handle to the subscription cache.
#[derive(Clone)]
pub struct SubscriptionCache {
    conn: Option<ConnectionManager>,
    client: Option<redis::Client>,
    ttl_secs: u64,
    op_timeout: Duration,
}

impl SubscriptionCache {
    pub fn new(client: Option<redis::Client>, conn: Option<ConnectionManager>, cache: &CacheConfig, redis: &RedisConfig) -> Self {
        Self {
            conn,
            client,
            ttl_secs: cache.ttl_secs,
            op_timeout: Duration::from_secs(redis.operation_timeout_secs),
        }
    }

    /// A cache that never hits — every get is a miss, every write a no-op.
    /// Used when Redis is unreachable at startup and in tests.
    pub fn disabled() -> Self {
        Self {
            conn: None,
            client: None,
            ttl_secs: 3600,
            op_timeout: Duration::from_secs(2),
        }
    }

    /// Fetch a cached subscription. Data and version come back in one round
    /// trip; a stamp mismatch deletes the entry and reports a miss.
    pub async fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        let mut conn = self.conn.clone()?;

        let fetched = tokio::time::timeout(self.op_timeout, async {
            redis::pipe()
                .get(data_key(&id))
                .get(version_key(&id))
                .query_async::<(Option<String>, Option<String>)>(&mut conn)
                .await
        })
        .await;

        let (data, stored_version) = match fetched {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Cache get failed, treating as miss");
                return None;
            }
            Err(_) => {
                tracing::warn!("Cache get timed out, treating as miss");
                return None;
            }
        };

        let data = data?;

        let cached: CachedSubscription = match serde_json::from_str(&data) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(error = %e, "Corrupted cache entry, deleting");
                self.delete_keys(id).await;
                return None;
            }
        };

        // The record is only trustworthy while its embedded stamp matches
        // the version key.
        if let Some(stored) = stored_version
            && stored != cached._cache_version.to_string()
        {
            tracing::debug!(subscription_id = %id, "Cache version mismatch, deleting entry");
            self.delete_keys(id).await;
            return None;
        }

        Some(cached.record)
    }

    /// Write a subscription through the cache: record + version token in one
    /// pipeline, bump the global version, and announce the change.
    pub async fn put(&self, record: &Subscription) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let id = record.id;

        let version = Utc::now().timestamp();
        let cached = CachedSubscription {
            record: record.clone(),
            _cache_version: version,
        };
        let serialized = match serde_json::to_string(&cached) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, subscription_id = %id, "Failed to serialize subscription for cache");
                return;
            }
        };

        let result = tokio::time::timeout(self.op_timeout, async {
            redis::pipe()
                .set_ex(version_key(&id), version.to_string(), self.ttl_secs * 2)
                .ignore()
                .incr(GLOBAL_VERSION_KEY, 1)
                .ignore()
                .set_ex(data_key(&id), serialized, self.ttl_secs)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
        })
        .await;

        match result {
            // Announce the write so other replicas drop their stale copies.
            // The message carries this write's stamp; listeners keep entries
            // at least as new as the announcement, so the fresh entry
            // survives its own broadcast.
            Ok(Ok(())) => {
                self.publish_invalidation(id, version).await;
            }
            Ok(Err(e)) => tracing::warn!(error = %e, subscription_id = %id, "Failed to cache subscription"),
            Err(_) => tracing::warn!(subscription_id = %id, "Cache put timed out"),
        }
    }

    /// Drop the cached record and announce the invalidation to all replicas.
    /// The announcement goes out even when no local entry existed.
    pub async fn invalidate(&self, id: SubscriptionId) {
        self.delete_keys(id).await;
        self.publish_invalidation(id, Utc::now().timestamp()).await;
    }

    /// Current value of the global version counter.
    pub async fn global_version(&self) -> Option<i64> {
        let mut conn = self.conn.clone()?;
        match tokio::time::timeout(self.op_timeout, conn.get::<_, Option<i64>>(GLOBAL_VERSION_KEY)).await {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read global cache version");
                None
            }
            Err(_) => None,
        }
    }

    /// Apply a received invalidation: drop the local entry unless it is at
    /// least as new as the announcement (a replica's own `put` broadcast
    /// must not erase the entry it just wrote).
    async fn apply_invalidation(&self, message: &InvalidationMessage) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let id = message.subscription_id;

        let local_version = tokio::time::timeout(self.op_timeout, conn.get::<_, Option<String>>(version_key(&id))).await;
        if let Ok(Ok(Some(stored))) = local_version
            && let Ok(stored) = stored.parse::<i64>()
            && stored >= message.timestamp
        {
            tracing::debug!(subscription_id = %id, "Local entry newer than invalidation, keeping");
            return;
        }

        self.delete_keys(id).await;
    }

    async fn delete_keys(&self, id: SubscriptionId) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let result = tokio::time::timeout(
            self.op_timeout,
            conn.del::<_, ()>(&[data_key(&id), version_key(&id)][..]),
        )
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, subscription_id = %id, "Failed to delete cache keys"),
            Err(_) => tracing::warn!(subscription_id = %id, "Cache delete timed out"),
        }
    }

    async fn publish_invalidation(&self, id: SubscriptionId, timestamp: i64) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let message = match serde_json::to_string(&InvalidationMessage::invalidate(id, timestamp)) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize invalidation message");
                return;
            }
        };

        let result = tokio::time::timeout(self.op_timeout, async {
            redis::pipe()
                .publish(UPDATE_CHANNEL, message)
                .ignore()
                .incr(GLOBAL_VERSION_KEY, 1)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, subscription_id = %id, "Failed to publish cache invalidation"),
            Err(_) => tracing::warn!(subscription_id = %id, "Invalidation publish timed out"),
        }
    }

    /// Spawn the long-lived invalidation listener. It deletes the two cache
    /// keys for every received id and restarts itself after a bounded delay
    /// when the pub/sub connection drops.
    pub fn spawn_listener(&self, shutdown: CancellationToken) {
        let Some(client) = self.client.clone() else {
            tracing::info!("Cache disabled, not starting invalidation listener");
            return;
        };
        let cache = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Invalidation listener shutting down");
                        return;
                    }
                    result = run_listener(&client, &cache) => {
                        match result {
                            Ok(()) => tracing::warn!("Invalidation listener stream ended, restarting"),
                            Err(e) => tracing::warn!(error = %e, "Invalidation listener failed, restarting"),
                        }
                        tokio::time::sleep(LISTENER_RESTART_DELAY).await;
                    }
                }
            }
        });
    }
}

/// One listener session: subscribe and process messages until the
/// connection drops.
async fn run_listener(client: &redis::Client, cache: &SubscriptionCache) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(UPDATE_CHANNEL).await?;
    tracing::info!(channel = UPDATE_CHANNEL, "Cache invalidation listener started");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read invalidation payload");
                continue;
            }
        };

        match serde_json::from_str::<InvalidationMessage>(&payload) {
            Ok(message) if message.action == "invalidate" => {
                tracing::debug!(subscription_id = %message.subscription_id, "Received invalidation");
                cache.apply_invalidation(&message).await;
            }
            Ok(message) => {
                tracing::debug!(action = %message.action, "Ignoring unknown invalidation action");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Invalid JSON in invalidation message");
            }
        }
    }

    Ok(())
}
