//! # courier: Webhook Delivery Service
//!
//! `courier` accepts inbound HTTP payloads addressed to registered
//! subscriptions and guarantees at-least-once delivery of those payloads to
//! each subscription's target URL, with bounded retry, exponential backoff,
//! signature verification, event-type filtering, per-subscription caching,
//! and durable per-attempt logging.
//!
//! ## Architecture
//!
//! The service is built on [Axum](https://github.com/tokio-rs/axum) for the
//! HTTP layer, PostgreSQL for all durable state, and Redis for the shared
//! ephemeral state: the subscription cache, the delivery queue, and the
//! rate-limit counters.
//!
//! ### Ingestion
//!
//! `POST /api/v1/ingest/{subscription_id}` validates the payload size while
//! streaming the body, resolves the subscription with the event-type
//! predicate, verifies the HMAC signature when both sides provide one,
//! persists a PENDING delivery task, and publishes the task id to the
//! delivery queue. The response is a 202 with the task resource; delivery
//! itself happens asynchronously.
//!
//! ### Delivery
//!
//! A pool of workers consumes the queue. Each item is processed through a
//! transactional claim (`SELECT ... FOR UPDATE`) that serializes attempts
//! per task and absorbs duplicate or premature queue items, followed by an
//! HTTP POST bounded by the per-attempt deadline, a durable per-attempt log
//! row, and a state transition: COMPLETED on 2xx, PENDING with a backoff
//! schedule while the retry budget lasts, FAILED once it is exhausted.
//!
//! ### Background services
//!
//! Alongside the HTTP server run the delivery workers, the cache
//! invalidation listener, a maintenance sweep that recovers stuck and
//! lost tasks, the retention jobs for logs and failed tasks, and a
//! Postgres advisory-lock leader election that scopes the periodic jobs
//! to one replica.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod leader_election;
pub mod limits;
pub mod queue;
pub mod retention;
pub mod signing;
pub mod telemetry;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, instrument};

use crate::cache::SubscriptionCache;
pub use crate::config::Config;
use crate::limits::{RateLimiter, TargetRateLimiter};
use crate::queue::DeliveryQueue;
use crate::worker::DeliveryContext;

/// Advisory lock id for leader election ("COURIER1" in hex).
const LEADER_LOCK_ID: i64 = 0x434F_5552_4945_5231_i64;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub cache: SubscriptionCache,
    pub queue: DeliveryQueue,
    pub limiter: RateLimiter,
}

/// Get the courier database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Build the application router with all endpoints and middleware.
pub fn build_router(state: &AppState) -> Router {
    // Subscription creation carries its own, stricter limiter
    let create_routes = Router::new()
        .route("/api/v1/subscriptions", post(api::handlers::subscriptions::create_subscription))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            limits::subscription_create_rate_limit,
        ))
        .with_state(state.clone());

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/api/v1/ingest/{subscription_id}", post(api::handlers::ingest::ingest_webhook))
        .route("/api/v1/deliveries/{task_id}", get(api::handlers::deliveries::get_delivery))
        .route("/api/v1/subscriptions", get(api::handlers::subscriptions::list_subscriptions))
        .route(
            "/api/v1/subscriptions/{id}",
            get(api::handlers::subscriptions::get_subscription)
                .put(api::handlers::subscriptions::update_subscription)
                .delete(api::handlers::subscriptions::delete_subscription),
        )
        .route(
            "/api/v1/subscriptions/{id}/deliveries",
            get(api::handlers::subscriptions::list_subscription_deliveries),
        )
        .with_state(state.clone())
        .merge(create_routes);

    if state.config.enable_metrics {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                router = router.route("/internal/metrics", get(move || async move { handle.render() }));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install metrics recorder, /internal/metrics disabled");
            }
        }
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), limits::rate_limit_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Connect to Redis, degrading to disabled components when unreachable.
/// Cache, queue, and rate limiting all fail open; only Postgres is a hard
/// startup dependency.
async fn setup_redis(config: &Config) -> (Option<redis::Client>, Option<redis::aio::ConnectionManager>) {
    let client = match redis::Client::open(config.redis.url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid Redis URL, running without cache/queue/rate limiting");
            return (None, None);
        }
    };

    match client.get_connection_manager().await {
        Ok(conn) => {
            info!("Connected to Redis");
            (Some(client), Some(conn))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unreachable, running without cache/queue/rate limiting");
            (None, None)
        }
    }
}

/// Container for background services and their lifecycle management.
///
/// Holds the delivery workers, the maintenance sweep, the retention loop,
/// the cache invalidation listener, and leader election. Dropping the
/// struct cancels the shutdown token via the drop guard.
pub struct BackgroundServices {
    background_tasks: tokio::task::JoinSet<()>,
    task_names: HashMap<tokio::task::Id, &'static str>,
    shutdown_token: tokio_util::sync::CancellationToken,
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
    pub is_leader: Arc<AtomicBool>,
}

impl BackgroundServices {
    /// Start all background services for the given state.
    pub fn start(state: &AppState) -> anyhow::Result<Self> {
        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();
        let mut background_tasks = tokio::task::JoinSet::new();
        let mut task_names: HashMap<tokio::task::Id, &'static str> = HashMap::new();

        let config = &state.config;

        // Leadership gates the periodic jobs to a single replica
        let is_leader = Arc::new(AtomicBool::new(!config.background_services.leader_election.enabled));
        if config.background_services.leader_election.enabled {
            let id = background_tasks.spawn(leader_election::leader_election_task(
                state.db.clone(),
                is_leader.clone(),
                LEADER_LOCK_ID,
                shutdown_token.clone(),
            ));
            task_names.insert(id.id(), "leader-election");
        } else {
            info!("Leader election disabled: running periodic jobs on this replica");
        }

        state.cache.spawn_listener(shutdown_token.clone());

        let http_client = worker::build_http_client(&config.webhook)?;
        let target_limiter = TargetRateLimiter::new(
            state.limiter.clone(),
            config.webhook.target_rate_limit,
            config.webhook.target_rate_limit_window_secs,
        );
        let ctx = DeliveryContext {
            db: state.db.clone(),
            cache: state.cache.clone(),
            queue: state.queue.clone(),
            target_limiter,
            http_client,
            webhook: config.webhook.clone(),
            worker: config.worker.clone(),
        };

        for worker_id in 0..config.worker.count {
            let id = background_tasks.spawn(worker::worker_loop(worker_id, ctx.clone(), shutdown_token.clone()));
            task_names.insert(id.id(), "delivery-worker");
        }

        let id = background_tasks.spawn(worker::maintenance_loop(ctx.clone(), is_leader.clone(), shutdown_token.clone()));
        task_names.insert(id.id(), "maintenance");

        let id = background_tasks.spawn(retention::retention_loop(
            state.db.clone(),
            config.retention.clone(),
            is_leader.clone(),
            shutdown_token.clone(),
        ));
        task_names.insert(id.id(), "retention");

        Ok(Self {
            background_tasks,
            task_names,
            shutdown_token,
            drop_guard: Some(drop_guard),
            is_leader,
        })
    }

    /// Gracefully shutdown all background tasks.
    pub async fn shutdown(mut self) {
        self.shutdown_token.cancel();

        while let Some(result) = self.background_tasks.join_next_with_id().await {
            match result {
                Ok((task_id, ())) => {
                    let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::debug!(task = task_name, "Background task completed");
                }
                Err(e) => {
                    let task_name = self.task_names.get(&e.id()).copied().unwrap_or("unknown");
                    tracing::error!(task = task_name, error = %e, "Background task panicked");
                }
            }
        }
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] connects to Postgres and Redis, runs
///    migrations, and starts background services
/// 2. **Serve**: [`Application::serve`] binds the listener and handles
///    requests until the shutdown future resolves
/// 3. **Shutdown**: background services drain on the cancellation token
pub struct Application {
    router: Router,
    app_state: AppState,
    background: BackgroundServices,
}

impl Application {
    /// Create the application from configuration.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_pool(config, None).await
    }

    /// Create the application, optionally reusing an existing pool (tests).
    #[instrument(skip_all)]
    pub async fn with_pool(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        let pool = match pool {
            Some(pool) => pool,
            None => {
                let db = &config.database;
                sqlx::postgres::PgPoolOptions::new()
                    .max_connections(db.max_connections)
                    .min_connections(db.min_connections)
                    .acquire_timeout(std::time::Duration::from_secs(db.acquire_timeout_secs))
                    .idle_timeout((db.idle_timeout_secs > 0).then(|| std::time::Duration::from_secs(db.idle_timeout_secs)))
                    .max_lifetime((db.max_lifetime_secs > 0).then(|| std::time::Duration::from_secs(db.max_lifetime_secs)))
                    .connect(&db.url)
                    .await?
            }
        };

        migrator().run(&pool).await?;

        let (client, conn) = setup_redis(&config).await;
        let cache = SubscriptionCache::new(client.clone(), conn.clone(), &config.cache, &config.redis);
        let queue = DeliveryQueue::new(client, conn.clone(), &config.redis);
        let limiter = RateLimiter::new(conn, &config.redis);

        let app_state = AppState {
            db: pool,
            config,
            cache,
            queue,
            limiter,
        };

        let router = build_router(&app_state);
        let background = BackgroundServices::start(&app_state)?;

        Ok(Self {
            router,
            app_state,
            background,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    /// Serve until the shutdown future resolves, then drain background
    /// services.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.app_state.config.host, self.app_state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "courier listening");

        axum::serve(
            listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("HTTP server stopped, draining background services");
        self.background.shutdown().await;
        Ok(())
    }
}
