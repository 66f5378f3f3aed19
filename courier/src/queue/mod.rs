//! Delivery queue over Redis.
//!
//! Two structures back the queue:
//! - `courier:queue` — a list of ready items, produced with LPUSH and
//!   consumed with BRPOP
//! - `courier:queue:scheduled` — a sorted set of delayed items scored by
//!   their due time; a Lua script promotes due members onto the list
//!   before each blocking pop
//!
//! Items carry `{"task_id": ...}` JSON. The queue is advisory: workers
//! re-read the task from Postgres on claim, and duplicates are absorbed by
//! the claim protocol. Pushes fail open so a Redis outage never turns into
//! an ingestion error; the maintenance sweep re-enqueues anything lost.

use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use serde::{Deserialize, Serialize};

use crate::config::RedisConfig;
use crate::types::TaskId;

/// List of ready queue items.
pub const QUEUE_KEY: &str = "courier:queue";

/// Sorted set of delayed items, scored by due epoch.
pub const SCHEDULED_KEY: &str = "courier:queue:scheduled";

/// Upper bound on members promoted per pop iteration.
const PROMOTE_BATCH: usize = 100;

/// Atomically move due members from the scheduled set onto the ready list.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], 0, ARGV[1], 'LIMIT', 0, ARGV[2])
for i, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('LPUSH', KEYS[2], member)
end
return #due
"#;

/// Wire format of a queue item.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueItem {
    pub task_id: TaskId,
}

impl QueueItem {
    fn encode(task_id: TaskId) -> Result<String, serde_json::Error> {
        serde_json::to_string(&QueueItem { task_id })
    }
}

/// Producer handle for the delivery queue. Cloneable; pushes share the
/// multiplexed connection.
#[derive(Clone)]
pub struct DeliveryQueue {
    conn: Option<ConnectionManager>,
    client: Option<redis::Client>,
    op_timeout: Duration,
}

impl DeliveryQueue {
    pub fn new(client: Option<redis::Client>, conn: Option<ConnectionManager>, redis: &RedisConfig) -> Self {
        Self {
            conn,
            client,
            op_timeout: Duration::from_secs(redis.operation_timeout_secs),
        }
    }

    /// A queue that drops every push. Used when Redis is unreachable at
    /// startup and in tests; the maintenance sweep covers for it.
    pub fn disabled() -> Self {
        Self {
            conn: None,
            client: None,
            op_timeout: Duration::from_secs(2),
        }
    }

    /// Publish a task for immediate delivery. Returns whether the item was
    /// actually enqueued; callers treat `false` as survivable.
    pub async fn push(&self, task_id: TaskId) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        let item = match QueueItem::encode(task_id) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, %task_id, "Failed to encode queue item");
                return false;
            }
        };

        match tokio::time::timeout(self.op_timeout, conn.lpush::<_, _, ()>(QUEUE_KEY, item)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, %task_id, "Failed to enqueue task");
                false
            }
            Err(_) => {
                tracing::warn!(%task_id, "Enqueue timed out");
                false
            }
        }
    }

    /// Schedule a task for delivery after `delay_secs`.
    pub async fn push_delayed(&self, task_id: TaskId, delay_secs: i64) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        let item = match QueueItem::encode(task_id) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, %task_id, "Failed to encode queue item");
                return false;
            }
        };
        let due = Utc::now().timestamp() + delay_secs.max(0);

        match tokio::time::timeout(self.op_timeout, conn.zadd::<_, _, _, ()>(SCHEDULED_KEY, item, due)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, %task_id, "Failed to schedule task");
                false
            }
            Err(_) => {
                tracing::warn!(%task_id, "Delayed enqueue timed out");
                false
            }
        }
    }

    /// Open a dedicated consumer connection. BRPOP parks the connection, so
    /// each worker gets its own instead of sharing the multiplexed one.
    pub async fn consumer(&self) -> Option<QueueConsumer> {
        let client = self.client.clone()?;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(QueueConsumer { conn }),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open queue consumer connection");
                None
            }
        }
    }
}

/// Per-worker consumer with its own connection.
pub struct QueueConsumer {
    conn: MultiplexedConnection,
}

impl QueueConsumer {
    /// Promote due delayed items, then block up to `timeout` for the next
    /// ready item. `Ok(None)` means the wait timed out with an empty queue.
    pub async fn pop(&mut self, timeout: Duration) -> redis::RedisResult<Option<TaskId>> {
        let now = Utc::now().timestamp();
        redis::Script::new(PROMOTE_SCRIPT)
            .key(SCHEDULED_KEY)
            .key(QUEUE_KEY)
            .arg(now)
            .arg(PROMOTE_BATCH)
            .invoke_async::<i64>(&mut self.conn)
            .await?;

        let popped: Option<(String, String)> = self.conn.brpop(QUEUE_KEY, timeout.as_secs_f64()).await?;

        let Some((_, raw)) = popped else {
            return Ok(None);
        };

        match serde_json::from_str::<QueueItem>(&raw) {
            Ok(item) => Ok(Some(item.task_id)),
            Err(e) => {
                tracing::warn!(error = %e, %raw, "Dropping malformed queue item");
                Ok(None)
            }
        }
    }
}
