//! Database repository for delivery attempt logs.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::logs::{DeliveryLog, LogCreateDBRequest};
use crate::types::{SubscriptionId, TaskId, abbrev_uuid};

/// Repository for delivery log operations. Logs are append-only: rows are
/// created once per attempt and removed only by retention.
pub struct Logs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Logs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Record one delivery attempt.
    #[instrument(skip(self, request), fields(task_id = %abbrev_uuid(&request.delivery_task_id), attempt = request.attempt_number), err)]
    pub async fn create(&mut self, request: &LogCreateDBRequest) -> Result<DeliveryLog> {
        let log = sqlx::query_as::<_, DeliveryLog>(
            r#"
            INSERT INTO delivery_logs
                (delivery_task_id, subscription_id, target_url, attempt_number, status, status_code, error_details)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(request.delivery_task_id)
        .bind(request.subscription_id)
        .bind(&request.target_url)
        .bind(request.attempt_number)
        .bind(request.status)
        .bind(request.status_code)
        .bind(&request.error_details)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(log)
    }

    /// All logs for a task, ordered by attempt.
    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&task_id)), err)]
    pub async fn list_by_task(&mut self, task_id: TaskId) -> Result<Vec<DeliveryLog>> {
        let logs = sqlx::query_as::<_, DeliveryLog>(
            r#"
            SELECT * FROM delivery_logs
            WHERE delivery_task_id = $1
            ORDER BY attempt_number ASC, created_at ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(logs)
    }

    /// Recent logs for a subscription, newest first.
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id)), err)]
    pub async fn list_recent_by_subscription(&mut self, subscription_id: SubscriptionId, limit: i64) -> Result<Vec<DeliveryLog>> {
        let logs = sqlx::query_as::<_, DeliveryLog>(
            r#"
            SELECT * FROM delivery_logs
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(logs)
    }

    /// Delete logs created before the cutoff. Used by retention.
    #[instrument(skip(self), err)]
    pub async fn delete_created_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delivery_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::{Subscriptions, Tasks};
    use crate::db::models::logs::LogStatus;
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use crate::db::models::tasks::TaskCreateDBRequest;
    use sqlx::PgPool;

    async fn create_task(pool: &PgPool) -> (SubscriptionId, TaskId) {
        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn)
            .create(&SubscriptionCreateDBRequest {
                target_url: "https://example.com/hook".to_string(),
                secret: None,
                event_types: None,
            })
            .await
            .unwrap();
        let task = Tasks::new(&mut conn)
            .create(&TaskCreateDBRequest {
                subscription_id: subscription.id,
                payload: serde_json::json!({}),
                event_type: None,
                max_retries: 5,
            })
            .await
            .unwrap();
        (subscription.id, task.id)
    }

    fn attempt(subscription_id: SubscriptionId, task_id: TaskId, n: i32, status: LogStatus) -> LogCreateDBRequest {
        LogCreateDBRequest {
            delivery_task_id: task_id,
            subscription_id,
            target_url: "https://example.com/hook".to_string(),
            attempt_number: n,
            status,
            status_code: Some(500),
            error_details: Some("HTTP 500".to_string()),
        }
    }

    #[sqlx::test]
    async fn test_logs_ordered_by_attempt(pool: PgPool) {
        let (sub_id, task_id) = create_task(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Logs::new(&mut conn);

        repo.create(&attempt(sub_id, task_id, 2, LogStatus::Success)).await.unwrap();
        repo.create(&attempt(sub_id, task_id, 1, LogStatus::FailedAttempt)).await.unwrap();

        let logs = repo.list_by_task(task_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].attempt_number, 1);
        assert_eq!(logs[0].status, LogStatus::FailedAttempt);
        assert_eq!(logs[1].attempt_number, 2);
        assert_eq!(logs[1].status, LogStatus::Success);
    }

    #[sqlx::test]
    async fn test_recent_by_subscription_limits(pool: PgPool) {
        let (sub_id, task_id) = create_task(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Logs::new(&mut conn);

        for n in 1..=5 {
            repo.create(&attempt(sub_id, task_id, n, LogStatus::FailedAttempt)).await.unwrap();
        }

        let logs = repo.list_recent_by_subscription(sub_id, 3).await.unwrap();
        assert_eq!(logs.len(), 3);
    }

    #[sqlx::test]
    async fn test_retention_cutoff(pool: PgPool) {
        let (sub_id, task_id) = create_task(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Logs::new(&mut conn);

        let old = repo.create(&attempt(sub_id, task_id, 1, LogStatus::FailedAttempt)).await.unwrap();
        repo.create(&attempt(sub_id, task_id, 2, LogStatus::Success)).await.unwrap();

        sqlx::query("UPDATE delivery_logs SET created_at = now() - interval '80 hours' WHERE id = $1")
            .bind(old.id)
            .execute(&pool)
            .await
            .unwrap();

        let deleted = repo
            .delete_created_before(Utc::now() - chrono::Duration::hours(72))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = repo.list_by_task(task_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempt_number, 2);

        // Idempotent: running again deletes nothing
        let deleted = repo
            .delete_created_before(Utc::now() - chrono::Duration::hours(72))
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }

    #[sqlx::test]
    async fn test_cascade_on_task_delete(pool: PgPool) {
        let (sub_id, task_id) = create_task(&pool).await;
        let mut conn = pool.acquire().await.unwrap();

        Logs::new(&mut conn)
            .create(&attempt(sub_id, task_id, 1, LogStatus::Failure))
            .await
            .unwrap();

        sqlx::query("DELETE FROM delivery_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&pool)
            .await
            .unwrap();

        let logs = Logs::new(&mut conn).list_by_task(task_id).await.unwrap();
        assert!(logs.is_empty());
    }
}
