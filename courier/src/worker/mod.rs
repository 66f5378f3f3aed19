//! Delivery worker pool: consume queue items, attempt HTTP delivery,
//! record the attempt, and advance the task state machine.
//!
//! ```text
//! worker_loop()
//!   └─ consumer.pop()                  // promote due delayed items + BRPOP
//!        └─ process_delivery(task_id)
//!             ├─ peek task             // drop terminal / premature / unknown
//!             ├─ resolve subscription  // cache → store read-through
//!             ├─ target limiter gate   // re-enqueue, no attempt burned
//!             ├─ claim (transactional) // FOR UPDATE, IN_PROGRESS, attempt+1
//!             ├─ HTTP POST             // bounded by the per-attempt deadline
//!             └─ classify + persist    // log row + state transition, one txn
//! ```
//!
//! The task row is the serialization point: the claim's row lock means at
//! most one worker runs an attempt for a task, and duplicate or premature
//! queue items fall out of the claim as no-ops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sqlx::{PgConnection, PgPool};
use tokio_util::sync::CancellationToken;

use crate::cache::SubscriptionCache;
use crate::config::{WebhookConfig, WorkerConfig};
use crate::db::errors::{DbError, Result as DbResult};
use crate::db::handlers::{Logs, Subscriptions, Tasks};
use crate::db::models::logs::{LogCreateDBRequest, LogStatus};
use crate::db::models::subscriptions::Subscription;
use crate::limits::TargetRateLimiter;
use crate::queue::DeliveryQueue;
use crate::types::TaskId;

/// Shared dependencies of the worker pool.
#[derive(Clone)]
pub struct DeliveryContext {
    pub db: PgPool,
    pub cache: SubscriptionCache,
    pub queue: DeliveryQueue,
    pub target_limiter: TargetRateLimiter,
    pub http_client: reqwest::Client,
    pub webhook: WebhookConfig,
    pub worker: WorkerConfig,
}

/// Build the outbound HTTP client used for all delivery attempts.
pub fn build_http_client(config: &WebhookConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .danger_accept_invalid_certs(!config.verify_ssl_certificates)
        .build()
}

/// Outcome of a single HTTP send attempt.
#[derive(Debug)]
pub enum SendOutcome {
    Success {
        status_code: u16,
    },
    Failure {
        status_code: Option<u16>,
        error: String,
        /// Transport errors and non-2xx responses retry; malformed requests
        /// (e.g. an unusable target URL) do not.
        retryable: bool,
    },
}

/// POST the payload as JSON to the target and classify the transport-level
/// result. Never errors: every failure mode maps to a `SendOutcome`.
pub async fn send_webhook(client: &reqwest::Client, target_url: &str, payload: &serde_json::Value) -> SendOutcome {
    match client.post(target_url).json(payload).send().await {
        Ok(response) => {
            let status_code = response.status().as_u16();
            if response.status().is_success() {
                SendOutcome::Success { status_code }
            } else {
                SendOutcome::Failure {
                    status_code: Some(status_code),
                    error: format!("HTTP {status_code}"),
                    retryable: true,
                }
            }
        }
        Err(e) => SendOutcome::Failure {
            status_code: None,
            error: e.to_string(),
            retryable: !e.is_builder(),
        },
    }
}

/// Map a send outcome onto the log status for this attempt, consulting the
/// retry budget so the exhausting attempt is recorded as FAILURE rather
/// than a trailing FAILED_ATTEMPT.
pub fn classify(outcome: &SendOutcome, attempt_count: i32, max_retries: i32) -> (LogStatus, Option<i32>, Option<String>) {
    match outcome {
        SendOutcome::Success { status_code } => (LogStatus::Success, Some(*status_code as i32), None),
        SendOutcome::Failure {
            status_code,
            error,
            retryable,
        } => {
            let status = if *retryable && attempt_count < max_retries {
                LogStatus::FailedAttempt
            } else {
                LogStatus::Failure
            };
            (status, status_code.map(|c| c as i32), Some(error.clone()))
        }
    }
}

/// Process one queue item end to end. Errors are absorbed here: database
/// failures re-enqueue the item with the first backoff delay, everything
/// else is logged.
pub async fn process_delivery(ctx: &DeliveryContext, task_id: TaskId) {
    if let Err(e) = try_process(ctx, task_id).await {
        let delay = ctx.webhook.retry_delays_secs.first().copied().unwrap_or(10);
        tracing::error!(%task_id, error = %e, delay_secs = delay, "Database error during delivery, re-enqueueing");
        ctx.queue.push_delayed(task_id, delay).await;
    }
}

async fn try_process(ctx: &DeliveryContext, task_id: TaskId) -> DbResult<()> {
    // Peek without locking: stale queue items (terminal task, premature
    // retry, vanished row) drop here without touching the row.
    let mut conn = ctx.db.acquire().await.map_err(DbError::from)?;
    let Some(task) = Tasks::new(&mut conn).get_by_id(task_id).await? else {
        tracing::debug!(%task_id, "Task not found, dropping queue item");
        return Ok(());
    };
    if task.status.is_terminal() {
        tracing::debug!(%task_id, status = task.status.as_str(), "Task already terminal, dropping duplicate");
        return Ok(());
    }
    if !task.is_due(Utc::now()) {
        tracing::debug!(%task_id, "Task not yet due, dropping premature item");
        return Ok(());
    }

    let Some(subscription) = resolve_subscription(ctx, &mut conn, task.subscription_id).await? else {
        // Subscription deleted out from under the task; the cascade will
        // have removed (or will remove) the task row as well.
        tracing::warn!(%task_id, subscription_id = %task.subscription_id, "Subscription not found for task, dropping");
        return Ok(());
    };
    drop(conn);

    // Gate on the per-target budget before claiming so a deferred send
    // burns no attempt and writes no log.
    if !ctx.target_limiter.allow(&subscription.target_url).await {
        tracing::debug!(%task_id, target_url = %subscription.target_url, "Target rate limited, deferring");
        counter!("courier_deliveries_deferred_total").increment(1);
        ctx.queue.push_delayed(task_id, ctx.worker.target_limited_delay_secs).await;
        return Ok(());
    }

    // Claim: the row lock serializes attempts on this task.
    let mut tx = ctx.db.begin().await.map_err(DbError::from)?;
    let claimed = Tasks::new(&mut tx).claim(task_id).await?;
    let Some(claimed) = claimed else {
        tx.rollback().await.map_err(DbError::from)?;
        return Ok(());
    };
    tx.commit().await.map_err(DbError::from)?;

    counter!("courier_delivery_attempts_total").increment(1);
    tracing::debug!(
        %task_id,
        target_url = %subscription.target_url,
        attempt = claimed.attempt_count,
        "Sending webhook"
    );

    let outcome = send_webhook(&ctx.http_client, &subscription.target_url, &claimed.payload).await;
    let (status, status_code, error_details) = classify(&outcome, claimed.attempt_count, claimed.max_retries);

    // Record the attempt and advance the state machine atomically.
    let mut tx = ctx.db.begin().await.map_err(DbError::from)?;
    Logs::new(&mut tx)
        .create(&LogCreateDBRequest {
            delivery_task_id: claimed.id,
            subscription_id: claimed.subscription_id,
            target_url: subscription.target_url.clone(),
            attempt_number: claimed.attempt_count,
            status,
            status_code,
            error_details: error_details.clone(),
        })
        .await?;

    let mut retry_delay = None;
    match status {
        LogStatus::Success => {
            Tasks::new(&mut tx).mark_completed(claimed.id).await?;
            counter!("courier_deliveries_total", "outcome" => "success").increment(1);
            tracing::info!(%task_id, attempt = claimed.attempt_count, status_code = ?status_code, "Webhook delivered");
        }
        LogStatus::FailedAttempt => {
            let delay = ctx.webhook.backoff_delay_secs(claimed.attempt_count);
            Tasks::new(&mut tx)
                .mark_retry(claimed.id, Utc::now() + chrono::Duration::seconds(delay))
                .await?;
            retry_delay = Some(delay);
            tracing::warn!(
                %task_id,
                attempt = claimed.attempt_count,
                status_code = ?status_code,
                error = error_details.as_deref().unwrap_or(""),
                delay_secs = delay,
                "Delivery failed, retry scheduled"
            );
        }
        LogStatus::Failure => {
            Tasks::new(&mut tx).mark_failed(claimed.id).await?;
            counter!("courier_deliveries_total", "outcome" => "failure").increment(1);
            tracing::warn!(
                %task_id,
                attempt = claimed.attempt_count,
                status_code = ?status_code,
                error = error_details.as_deref().unwrap_or(""),
                "Delivery failed terminally"
            );
        }
    }
    tx.commit().await.map_err(DbError::from)?;

    if let Some(delay) = retry_delay {
        // Best effort: if the push is lost the maintenance sweep re-enqueues
        // the task once it is due.
        ctx.queue.push_delayed(task_id, delay).await;
    }

    Ok(())
}

/// Resolve a subscription through the cache, falling back to the store and
/// filling the cache on a miss.
async fn resolve_subscription(
    ctx: &DeliveryContext,
    conn: &mut PgConnection,
    id: crate::types::SubscriptionId,
) -> DbResult<Option<Subscription>> {
    if let Some(subscription) = ctx.cache.get(id).await {
        return Ok(Some(subscription));
    }

    let subscription = Subscriptions::new(conn).get_by_id(id).await?;
    if let Some(ref subscription) = subscription {
        ctx.cache.put(subscription).await;
    }
    Ok(subscription)
}

/// Long-lived worker: own queue connection, pop, process, repeat.
pub async fn worker_loop(worker_id: usize, ctx: DeliveryContext, shutdown: CancellationToken) {
    let poll_timeout = Duration::from_secs(ctx.worker.poll_timeout_secs);

    'reconnect: loop {
        let mut consumer = loop {
            if shutdown.is_cancelled() {
                return;
            }
            match ctx.queue.consumer().await {
                Some(consumer) => break consumer,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        };

        tracing::info!(worker_id, "Delivery worker started");

        loop {
            let popped = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(worker_id, "Delivery worker shutting down");
                    return;
                }
                popped = consumer.pop(poll_timeout) => popped,
            };

            match popped {
                Ok(Some(task_id)) => process_delivery(&ctx, task_id).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Queue pop failed, reconnecting");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue 'reconnect;
                }
            }
        }
    }
}

/// One maintenance pass: unstick IN_PROGRESS tasks past the processing
/// timeout, then re-enqueue due PENDING tasks whose queue message was
/// lost. Returns how many tasks were put back on the queue.
pub async fn run_maintenance_pass(ctx: &DeliveryContext) -> DbResult<usize> {
    let mut conn = ctx.db.acquire().await.map_err(DbError::from)?;
    let unstuck = Tasks::new(&mut conn)
        .unstick_stale(ctx.worker.processing_timeout_secs as f64)
        .await?;
    let overdue = Tasks::new(&mut conn)
        .list_overdue_pending(ctx.worker.maintenance_interval_secs as f64, 100)
        .await?;
    drop(conn);

    let mut requeued = 0;
    for task_id in unstuck.into_iter().chain(overdue) {
        if ctx.queue.push(task_id).await {
            requeued += 1;
        }
    }

    if requeued > 0 {
        tracing::info!(count = requeued, "Maintenance sweep re-enqueued tasks");
    }
    Ok(requeued)
}

/// Periodic maintenance loop. Runs only on the elected leader so replicas
/// do not race each other re-enqueueing the same tasks.
pub async fn maintenance_loop(ctx: DeliveryContext, is_leader: Arc<AtomicBool>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(ctx.worker.maintenance_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Maintenance loop shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        if !is_leader.load(Ordering::Relaxed) {
            continue;
        }

        if let Err(e) = run_maintenance_pass(&ctx).await {
            tracing::error!(error = %e, "Maintenance pass failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::{Logs, Subscriptions, Tasks};
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use crate::db::models::tasks::{TaskCreateDBRequest, TaskStatus};
    use sqlx::PgPool;
    use wiremock::matchers::{body_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_ctx(pool: PgPool) -> DeliveryContext {
        let webhook = WebhookConfig {
            timeout_secs: 2,
            ..WebhookConfig::default()
        };
        let http_client = build_http_client(&webhook).unwrap();
        DeliveryContext {
            db: pool,
            cache: SubscriptionCache::disabled(),
            queue: DeliveryQueue::disabled(),
            target_limiter: TargetRateLimiter::disabled(),
            http_client,
            webhook,
            worker: WorkerConfig::default(),
        }
    }

    async fn create_task(pool: &PgPool, target_url: &str, max_retries: i32) -> TaskId {
        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn)
            .create(&SubscriptionCreateDBRequest {
                target_url: target_url.to_string(),
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
                max_retries,
            })
            .await
            .unwrap()
            .id
    }

    async fn force_due(pool: &PgPool, task_id: TaskId) {
        sqlx::query("UPDATE delivery_tasks SET next_attempt_at = now() - interval '1 second' WHERE id = $1")
            .bind(task_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[test]
    fn test_classify_success() {
        let outcome = SendOutcome::Success { status_code: 200 };
        let (status, code, error) = classify(&outcome, 1, 5);
        assert_eq!(status, LogStatus::Success);
        assert_eq!(code, Some(200));
        assert!(error.is_none());
    }

    #[test]
    fn test_classify_retryable_under_budget() {
        let outcome = SendOutcome::Failure {
            status_code: Some(500),
            error: "HTTP 500".to_string(),
            retryable: true,
        };
        let (status, code, error) = classify(&outcome, 1, 5);
        assert_eq!(status, LogStatus::FailedAttempt);
        assert_eq!(code, Some(500));
        assert_eq!(error.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn test_classify_exhausted_budget_is_failure() {
        let outcome = SendOutcome::Failure {
            status_code: Some(500),
            error: "HTTP 500".to_string(),
            retryable: true,
        };
        let (status, _, _) = classify(&outcome, 5, 5);
        assert_eq!(status, LogStatus::Failure);
    }

    #[test]
    fn test_classify_non_retryable_is_immediate_failure() {
        let outcome = SendOutcome::Failure {
            status_code: None,
            error: "builder error".to_string(),
            retryable: false,
        };
        let (status, code, _) = classify(&outcome, 1, 5);
        assert_eq!(status, LogStatus::Failure);
        assert!(code.is_none());
    }

    #[tokio::test]
    async fn test_send_webhook_posts_payload_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({"k": "v"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let outcome = send_webhook(&client, &server.uri(), &serde_json::json!({"k": "v"})).await;
        assert!(matches!(outcome, SendOutcome::Success { status_code: 200 }));
    }

    #[tokio::test]
    async fn test_send_webhook_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let outcome = send_webhook(&client, &server.uri(), &serde_json::json!({})).await;
        match outcome {
            SendOutcome::Failure {
                status_code,
                error,
                retryable,
            } => {
                assert_eq!(status_code, Some(503));
                assert_eq!(error, "HTTP 503");
                assert!(retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_webhook_maps_transport_errors() {
        // Nothing listens on this port
        let client = reqwest::Client::new();
        let outcome = send_webhook(&client, "http://127.0.0.1:1", &serde_json::json!({})).await;
        match outcome {
            SendOutcome::Failure {
                status_code, retryable, ..
            } => {
                assert!(status_code.is_none());
                assert!(retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_webhook_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let outcome = send_webhook(&client, &server.uri(), &serde_json::json!({})).await;
        assert!(matches!(
            outcome,
            SendOutcome::Failure {
                status_code: None,
                retryable: true,
                ..
            }
        ));
    }

    #[sqlx::test]
    async fn test_process_happy_path(pool: PgPool) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = test_ctx(pool.clone());
        let task_id = create_task(&pool, &server.uri(), 5).await;

        process_delivery(&ctx, task_id).await;

        let mut conn = pool.acquire().await.unwrap();
        let task = Tasks::new(&mut conn).get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 1);
        assert!(task.next_attempt_at.is_none());

        let logs = Logs::new(&mut conn).list_by_task(task_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);
        assert_eq!(logs[0].status_code, Some(200));
        assert_eq!(logs[0].attempt_number, 1);
    }

    #[sqlx::test]
    async fn test_process_retry_then_succeed(pool: PgPool) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ctx = test_ctx(pool.clone());
        let task_id = create_task(&pool, &server.uri(), 5).await;

        // First attempt: 500 → PENDING with backoff ≈ now + 10s
        process_delivery(&ctx, task_id).await;
        let mut conn = pool.acquire().await.unwrap();
        let task = Tasks::new(&mut conn).get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 1);
        let delay = (task.next_attempt_at.unwrap() - Utc::now()).num_seconds();
        assert!((5..=15).contains(&delay), "expected ~10s backoff, got {delay}s");

        // Second attempt once due: 200 → COMPLETED
        force_due(&pool, task_id).await;
        process_delivery(&ctx, task_id).await;

        let task = Tasks::new(&mut conn).get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 2);

        let logs = Logs::new(&mut conn).list_by_task(task_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, LogStatus::FailedAttempt);
        assert_eq!(logs[0].status_code, Some(500));
        assert_eq!(logs[1].status, LogStatus::Success);
        assert_eq!(logs[1].status_code, Some(200));
    }

    #[sqlx::test]
    async fn test_process_exhausts_budget_with_final_failure(pool: PgPool) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ctx = test_ctx(pool.clone());
        let task_id = create_task(&pool, &server.uri(), 2).await;

        process_delivery(&ctx, task_id).await;
        force_due(&pool, task_id).await;
        process_delivery(&ctx, task_id).await;

        let mut conn = pool.acquire().await.unwrap();
        let task = Tasks::new(&mut conn).get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 2);
        assert!(task.next_attempt_at.is_none());

        let logs = Logs::new(&mut conn).list_by_task(task_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, LogStatus::FailedAttempt);
        // The exhausting attempt is recorded as FAILURE, not FAILED_ATTEMPT
        assert_eq!(logs[1].status, LogStatus::Failure);
        assert_eq!(logs[1].error_details.as_deref(), Some("HTTP 500"));

        // Re-delivering the item for a FAILED task is a no-op
        process_delivery(&ctx, task_id).await;
        let logs = Logs::new(&mut conn).list_by_task(task_id).await.unwrap();
        assert_eq!(logs.len(), 2);
    }

    #[sqlx::test]
    async fn test_process_drops_premature_items(pool: PgPool) {
        let ctx = test_ctx(pool.clone());
        let task_id = create_task(&pool, "http://127.0.0.1:1", 5).await;

        let mut conn = pool.acquire().await.unwrap();
        Tasks::new(&mut conn)
            .mark_retry(task_id, Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();

        process_delivery(&ctx, task_id).await;

        let task = Tasks::new(&mut conn).get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(Logs::new(&mut conn).list_by_task(task_id).await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn test_maintenance_pass_unsticks_and_reports(pool: PgPool) {
        let ctx = test_ctx(pool.clone());
        let task_id = create_task(&pool, "http://127.0.0.1:1", 5).await;

        // Simulate a worker that claimed the task and crashed
        let mut tx = pool.begin().await.unwrap();
        Tasks::new(&mut tx).claim(task_id).await.unwrap().unwrap();
        tx.commit().await.unwrap();
        sqlx::query("UPDATE delivery_tasks SET updated_at = now() - interval '10 minutes' WHERE id = $1")
            .bind(task_id)
            .execute(&pool)
            .await
            .unwrap();

        // Queue is disabled, so nothing is re-enqueued, but the task is
        // returned to PENDING either way.
        let requeued = run_maintenance_pass(&ctx).await.unwrap();
        assert_eq!(requeued, 0);

        let mut conn = pool.acquire().await.unwrap();
        let task = Tasks::new(&mut conn).get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
