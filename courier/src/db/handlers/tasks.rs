//! Database repository for delivery tasks and the claim protocol.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::tasks::{ClaimedTask, DeliveryTask, TaskCreateDBRequest, TaskStatus};
use crate::types::{TaskId, abbrev_uuid};

/// Repository for delivery task operations.
pub struct Tasks<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Tasks<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Create a new task in PENDING with no attempts recorded. A null
    /// `next_attempt_at` means the task is eligible immediately.
    #[instrument(skip(self, request), fields(subscription_id = %abbrev_uuid(&request.subscription_id)), err)]
    pub async fn create(&mut self, request: &TaskCreateDBRequest) -> Result<DeliveryTask> {
        let task = sqlx::query_as::<_, DeliveryTask>(
            r#"
            INSERT INTO delivery_tasks (subscription_id, payload, event_type, status, attempt_count, max_retries)
            VALUES ($1, $2, $3, 'PENDING', 0, $4)
            RETURNING *
            "#,
        )
        .bind(request.subscription_id)
        .bind(&request.payload)
        .bind(&request.event_type)
        .bind(request.max_retries)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(task)
    }

    /// Get a task by ID.
    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: TaskId) -> Result<Option<DeliveryTask>> {
        let task = sqlx::query_as::<_, DeliveryTask>("SELECT * FROM delivery_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(task)
    }

    /// Atomically claim a task for one delivery attempt.
    ///
    /// Must run inside a transaction: the row lock serializes attempts on a
    /// single task across workers. Returns `None` without mutating when the
    /// queue item is stale — the task is missing, terminal, already held by
    /// another worker, or not yet due.
    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&id)), err)]
    pub async fn claim(&mut self, id: TaskId) -> Result<Option<ClaimedTask>> {
        let task = sqlx::query_as::<_, DeliveryTask>("SELECT * FROM delivery_tasks WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        let Some(task) = task else {
            tracing::debug!("Task not found, dropping queue item");
            return Ok(None);
        };

        if task.status.is_terminal() {
            tracing::debug!(status = task.status.as_str(), "Task already terminal, dropping duplicate");
            return Ok(None);
        }

        // Another worker holds this task; the queue delivered a duplicate.
        if task.status == TaskStatus::InProgress && task.attempt_count > 0 {
            tracing::debug!("Task already in progress, dropping duplicate");
            return Ok(None);
        }

        // Premature redelivery: the retry is not due yet.
        if let Some(next_attempt_at) = task.next_attempt_at
            && next_attempt_at > Utc::now()
        {
            tracing::debug!(%next_attempt_at, "Task not yet due, dropping premature item");
            return Ok(None);
        }

        let attempt_count = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE delivery_tasks
            SET status = 'IN_PROGRESS', attempt_count = attempt_count + 1, updated_at = now()
            WHERE id = $1
            RETURNING attempt_count
            "#,
        )
        .bind(id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(Some(ClaimedTask {
            id: task.id,
            subscription_id: task.subscription_id,
            payload: task.payload,
            attempt_count,
            max_retries: task.max_retries,
        }))
    }

    /// Mark a task COMPLETED after a successful delivery.
    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_completed(&mut self, id: TaskId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET status = 'COMPLETED', next_attempt_at = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Return a task to PENDING with a future `next_attempt_at`.
    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&id), %next_attempt_at), err)]
    pub async fn mark_retry(&mut self, id: TaskId, next_attempt_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET status = 'PENDING', next_attempt_at = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_attempt_at)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Mark a task FAILED terminally.
    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_failed(&mut self, id: TaskId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET status = 'FAILED', next_attempt_at = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Return tasks stuck IN_PROGRESS longer than the processing timeout to
    /// PENDING. Handles worker crashes between claim and state transition.
    #[instrument(skip(self), err)]
    pub async fn unstick_stale(&mut self, processing_timeout_secs: f64) -> Result<Vec<TaskId>> {
        let ids = sqlx::query_scalar::<_, TaskId>(
            r#"
            UPDATE delivery_tasks
            SET status = 'PENDING', updated_at = now()
            WHERE status = 'IN_PROGRESS'
              AND updated_at < now() - make_interval(secs => $1)
            RETURNING id
            "#,
        )
        .bind(processing_timeout_secs)
        .fetch_all(&mut *self.db)
        .await?;

        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "Returned stale in-progress tasks to pending");
        }

        Ok(ids)
    }

    /// Find PENDING tasks that are due but have sat untouched for a grace
    /// period — their queue message was lost or the broker was down when
    /// they were created. The grace period keeps the sweep from racing
    /// items that are already in flight through the queue.
    #[instrument(skip(self), err)]
    pub async fn list_overdue_pending(&mut self, grace_secs: f64, limit: i64) -> Result<Vec<TaskId>> {
        let ids = sqlx::query_scalar::<_, TaskId>(
            r#"
            SELECT id FROM delivery_tasks
            WHERE status = 'PENDING'
              AND (next_attempt_at IS NULL OR next_attempt_at <= now())
              AND updated_at < now() - make_interval(secs => $1)
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(grace_secs)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(ids)
    }

    /// Delete terminally failed tasks older than the cutoff. Logs cascade.
    #[instrument(skip(self), err)]
    pub async fn delete_failed_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delivery_tasks WHERE status = 'FAILED' AND updated_at < $1")
            .bind(cutoff)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Subscriptions;
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use sqlx::PgPool;

    async fn create_test_task(pool: &PgPool) -> DeliveryTask {
        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn)
            .create(&SubscriptionCreateDBRequest {
                target_url: "https://example.com/hook".to_string(),
                secret: None,
                event_types: None,
            })
            .await
            .unwrap();

        Tasks::new(&mut conn)
            .create(&TaskCreateDBRequest {
                subscription_id: subscription.id,
                payload: serde_json::json!({"k": "v"}),
                event_type: None,
                max_retries: 5,
            })
            .await
            .unwrap()
    }

    async fn claim_in_tx(pool: &PgPool, id: TaskId) -> Option<ClaimedTask> {
        let mut tx = pool.begin().await.unwrap();
        let claimed = Tasks::new(&mut tx).claim(id).await.unwrap();
        tx.commit().await.unwrap();
        claimed
    }

    #[sqlx::test]
    async fn test_create_starts_pending_and_eligible(pool: PgPool) {
        let task = create_test_task(&pool).await;
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.next_attempt_at.is_none());
    }

    #[sqlx::test]
    async fn test_claim_increments_attempt(pool: PgPool) {
        let task = create_test_task(&pool).await;

        let claimed = claim_in_tx(&pool, task.id).await.unwrap();
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.subscription_id, task.subscription_id);

        let mut conn = pool.acquire().await.unwrap();
        let stored = Tasks::new(&mut conn).get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert_eq!(stored.attempt_count, 1);
    }

    #[sqlx::test]
    async fn test_claim_drops_duplicate_of_in_progress(pool: PgPool) {
        let task = create_test_task(&pool).await;

        assert!(claim_in_tx(&pool, task.id).await.is_some());
        // The queue delivered the same item twice
        assert!(claim_in_tx(&pool, task.id).await.is_none());
    }

    #[sqlx::test]
    async fn test_claim_drops_terminal_tasks(pool: PgPool) {
        let task = create_test_task(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        Tasks::new(&mut conn).mark_completed(task.id).await.unwrap();
        assert!(claim_in_tx(&pool, task.id).await.is_none());

        let other = create_test_task(&pool).await;
        Tasks::new(&mut conn).mark_failed(other.id).await.unwrap();
        assert!(claim_in_tx(&pool, other.id).await.is_none());
    }

    #[sqlx::test]
    async fn test_claim_drops_premature_retry(pool: PgPool) {
        let task = create_test_task(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        Tasks::new(&mut conn)
            .mark_retry(task.id, Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();

        assert!(claim_in_tx(&pool, task.id).await.is_none());

        // The task itself is untouched
        let stored = Tasks::new(&mut conn).get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
    }

    #[sqlx::test]
    async fn test_claim_allows_due_retry(pool: PgPool) {
        let task = create_test_task(&pool).await;

        assert!(claim_in_tx(&pool, task.id).await.is_some());

        let mut conn = pool.acquire().await.unwrap();
        Tasks::new(&mut conn)
            .mark_retry(task.id, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        let reclaimed = claim_in_tx(&pool, task.id).await.unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[sqlx::test]
    async fn test_terminal_transitions_clear_next_attempt(pool: PgPool) {
        let task = create_test_task(&pool).await;
        let mut conn = pool.acquire().await.unwrap();

        Tasks::new(&mut conn)
            .mark_retry(task.id, Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();
        Tasks::new(&mut conn).mark_failed(task.id).await.unwrap();

        let stored = Tasks::new(&mut conn).get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.next_attempt_at.is_none());
    }

    #[sqlx::test]
    async fn test_unstick_stale_returns_old_in_progress(pool: PgPool) {
        let task = create_test_task(&pool).await;
        claim_in_tx(&pool, task.id).await.unwrap();

        // Backdate the claim to simulate a crashed worker
        sqlx::query("UPDATE delivery_tasks SET updated_at = now() - interval '10 minutes' WHERE id = $1")
            .bind(task.id)
            .execute(&pool)
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let unstuck = Tasks::new(&mut conn).unstick_stale(300.0).await.unwrap();
        assert_eq!(unstuck, vec![task.id]);

        let stored = Tasks::new(&mut conn).get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);

        // A fresh claim is not stale
        let unstuck = Tasks::new(&mut conn).unstick_stale(300.0).await.unwrap();
        assert!(unstuck.is_empty());
    }

    #[sqlx::test]
    async fn test_delete_failed_before_cutoff(pool: PgPool) {
        let old = create_test_task(&pool).await;
        let fresh = create_test_task(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        Tasks::new(&mut conn).mark_failed(old.id).await.unwrap();
        Tasks::new(&mut conn).mark_failed(fresh.id).await.unwrap();

        sqlx::query("UPDATE delivery_tasks SET updated_at = now() - interval '8 days' WHERE id = $1")
            .bind(old.id)
            .execute(&pool)
            .await
            .unwrap();

        let deleted = Tasks::new(&mut conn)
            .delete_failed_before(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        assert!(Tasks::new(&mut conn).get_by_id(old.id).await.unwrap().is_none());
        assert!(Tasks::new(&mut conn).get_by_id(fresh.id).await.unwrap().is_some());
    }
}
