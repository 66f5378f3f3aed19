//! Helpers shared across handler tests: an app state wired to a test pool
//! with the Redis-backed components disabled (they all fail open).

use sqlx::PgPool;

use crate::{AppState, build_router, cache::SubscriptionCache, config::Config, limits::RateLimiter, queue::DeliveryQueue};

pub(crate) fn test_state(pool: PgPool) -> AppState {
    let mut config = Config::default();
    config.rate_limit.enabled = false;
    AppState {
        db: pool,
        config,
        cache: SubscriptionCache::disabled(),
        queue: DeliveryQueue::disabled(),
        limiter: RateLimiter::disabled(),
    }
}

pub(crate) fn test_server(state: AppState) -> axum_test::TestServer {
    axum_test::TestServer::new(build_router(&state)).expect("failed to build test server")
}
