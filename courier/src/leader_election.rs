use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Background task for leader election.
///
/// The retention jobs and the maintenance sweep should run on a single
/// replica at a time. PostgreSQL advisory locks are session-based, so the
/// leader keeps a dedicated connection alive for as long as it holds the
/// lock; losing the connection loses leadership.
#[instrument(skip_all)]
pub async fn leader_election_task(pool: PgPool, is_leader: Arc<AtomicBool>, lock_id: i64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
    let mut leader_conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Leader election shutting down");
                // Dropping the connection releases the advisory lock
                is_leader.store(false, Ordering::Relaxed);
                return;
            }
            _ = interval.tick() => {}
        }

        if !is_leader.load(Ordering::Relaxed) {
            // Try to acquire a connection and the lock
            match pool.acquire().await {
                Ok(mut conn) => {
                    match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                        .bind(lock_id)
                        .fetch_one(&mut *conn)
                        .await
                    {
                        Ok(true) => {
                            info!("Gained leadership");
                            is_leader.store(true, Ordering::Relaxed);
                            leader_conn = Some(conn); // Keep connection alive
                        }
                        Ok(false) => {
                            debug!("Following - will retry");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to check leader lock");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to acquire connection for leader election");
                }
            }
        } else if let Some(ref mut conn) = leader_conn {
            // Ping the connection; if it died, the advisory lock is gone
            match sqlx::query("SELECT 1").execute(&mut **conn).await {
                Ok(_) => {
                    debug!("Leadership renewed (connection alive)");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Lost leadership (connection died)");
                    is_leader.store(false, Ordering::Relaxed);
                    leader_conn = None;
                }
            }
        } else {
            tracing::error!("Inconsistent state: is_leader=true but no connection");
            is_leader.store(false, Ordering::Relaxed);
        }
    }
}
