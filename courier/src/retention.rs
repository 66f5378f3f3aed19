//! Periodic retention jobs: expired delivery logs and terminally failed
//! tasks. Both run in their own transaction, log the deleted count, and
//! are idempotent, so a replica taking over mid-window is harmless. They
//! run only on the elected leader.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::RetentionConfig;
use crate::db::errors::{DbError, Result as DbResult};
use crate::db::handlers::{Logs, Tasks};

/// Log retention runs hourly.
const LOG_RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Failed-task retention runs daily.
const FAILED_TASK_RETENTION_INTERVAL: Duration = Duration::from_secs(86_400);

/// Delete delivery logs past the retention window. Returns the count.
#[instrument(skip(pool), err)]
pub async fn run_log_retention(pool: &PgPool, retention_hours: i64) -> DbResult<u64> {
    let cutoff = Utc::now() - chrono::Duration::hours(retention_hours);

    let mut tx = pool.begin().await.map_err(DbError::from)?;
    let deleted = Logs::new(&mut tx).delete_created_before(cutoff).await?;
    tx.commit().await.map_err(DbError::from)?;

    tracing::info!(deleted, retention_hours, "Log retention pass complete");
    Ok(deleted)
}

/// Delete FAILED tasks past the retention window; their logs cascade.
/// Returns the count.
#[instrument(skip(pool), err)]
pub async fn run_failed_task_retention(pool: &PgPool, retention_days: i64) -> DbResult<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);

    let mut tx = pool.begin().await.map_err(DbError::from)?;
    let deleted = Tasks::new(&mut tx).delete_failed_before(cutoff).await?;
    tx.commit().await.map_err(DbError::from)?;

    tracing::info!(deleted, retention_days, "Failed-task retention pass complete");
    Ok(deleted)
}

/// Long-lived retention loop driving both jobs on their own cadences.
pub async fn retention_loop(pool: PgPool, config: RetentionConfig, is_leader: Arc<AtomicBool>, shutdown: CancellationToken) {
    let mut log_interval = tokio::time::interval(LOG_RETENTION_INTERVAL);
    let mut task_interval = tokio::time::interval(FAILED_TASK_RETENTION_INTERVAL);
    log_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    task_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Retention loop shutting down");
                return;
            }
            _ = log_interval.tick() => {
                if is_leader.load(Ordering::Relaxed)
                    && let Err(e) = run_log_retention(&pool, config.log_retention_hours).await
                {
                    tracing::error!(error = %e, "Log retention pass failed");
                }
            }
            _ = task_interval.tick() => {
                if is_leader.load(Ordering::Relaxed)
                    && let Err(e) = run_failed_task_retention(&pool, config.failed_task_retention_days).await
                {
                    tracing::error!(error = %e, "Failed-task retention pass failed");
                }
            }
        }
    }
}
