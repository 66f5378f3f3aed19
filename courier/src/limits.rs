//! Ingress rate limiting and the per-target send limiter.
//!
//! Counters live in Redis, keyed per client and route. Check-and-increment
//! is a single server-evaluated script for both strategies — a two-step
//! GET/INCR would race between replicas. On any Redis failure the limiter
//! fails open and marks the response with `X-Rate-Limit-Error`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use md5::{Digest, Md5};
use redis::aio::ConnectionManager;
use serde_json::json;
use uuid::Uuid;

use crate::AppState;
use crate::config::{RateLimitStrategy, RedisConfig};

/// Fixed-window check-and-increment: hash keyed by window start.
/// KEYS[1] = counter key, ARGV = [window_start, limit, expire_secs].
const FIXED_WINDOW_SCRIPT: &str = r#"
local count = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
if count >= tonumber(ARGV[2]) then
    return {0, count}
end
count = redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
redis.call('EXPIRE', KEYS[1], ARGV[3])
return {1, count}
"#;

/// Sliding-window check-and-add over a sorted set.
/// KEYS[1] = set key, ARGV = [window_start, limit, now, member, expire_secs].
/// Returns {allowed, count, oldest_score} so the caller can derive
/// Retry-After from the oldest entry still in the window.
const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[2]) then
    local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
    if oldest and #oldest > 0 then
        return {0, count, tonumber(oldest[2])}
    end
    return {0, count, 0}
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
return {1, count + 1, 0}
"#;

/// Short md5 digest of a route path, keeping rate-limit keys bounded.
fn route_hash(path: &str) -> String {
    let digest = hex::encode(Md5::digest(path.as_bytes()));
    digest[..8].to_string()
}

/// Counter key for a client on a route.
pub fn client_route_key(client: &str, route: &str) -> String {
    format!("ratelimit:{client}:{}", route_hash(route))
}

/// Sliding-window key for a delivery target.
pub fn target_key(target_url: &str) -> String {
    format!("target_rate_limit:{}", hex::encode(Md5::digest(target_url.as_bytes())))
}

/// Outcome of a limiter check.
#[derive(Debug)]
pub enum LimitDecision {
    Allowed { limit: i64, remaining: i64, reset_secs: i64 },
    Limited { limit: i64, retry_after_secs: i64 },
    /// Redis was unreachable; the caller fails open.
    Unavailable,
}

/// Shared handle to the Redis-backed limiter.
#[derive(Clone)]
pub struct RateLimiter {
    conn: Option<ConnectionManager>,
    op_timeout: Duration,
}

impl RateLimiter {
    pub fn new(conn: Option<ConnectionManager>, redis: &RedisConfig) -> Self {
        Self {
            conn,
            op_timeout: Duration::from_secs(redis.operation_timeout_secs),
        }
    }

    /// A limiter that always fails open. Used when Redis is unreachable at
    /// startup and in tests.
    pub fn disabled() -> Self {
        Self {
            conn: None,
            op_timeout: Duration::from_secs(2),
        }
    }

    /// Run one atomic check-and-increment against the given key.
    pub async fn check(&self, key: &str, limit: i64, window_secs: i64, strategy: RateLimitStrategy) -> LimitDecision {
        let Some(mut conn) = self.conn.clone() else {
            return LimitDecision::Unavailable;
        };
        let now = Utc::now().timestamp();

        let result = match strategy {
            RateLimitStrategy::FixedWindow => {
                let window_start = now - now % window_secs;
                let invocation = tokio::time::timeout(
                    self.op_timeout,
                    redis::Script::new(FIXED_WINDOW_SCRIPT)
                        .key(key)
                        .arg(window_start)
                        .arg(limit)
                        .arg(window_secs * 2)
                        .invoke_async::<(i64, i64)>(&mut conn),
                )
                .await;

                match invocation {
                    Ok(Ok((allowed, count))) => {
                        let reset_secs = window_secs - now % window_secs;
                        if allowed == 1 {
                            Ok(LimitDecision::Allowed {
                                limit,
                                remaining: (limit - count).max(0),
                                reset_secs,
                            })
                        } else {
                            Ok(LimitDecision::Limited {
                                limit,
                                retry_after_secs: reset_secs.max(1),
                            })
                        }
                    }
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("timed out".to_string()),
                }
            }
            RateLimitStrategy::SlidingWindow => {
                let window_start = now - window_secs;
                let member = format!("{}:{}", Uuid::new_v4(), now);
                let invocation = tokio::time::timeout(
                    self.op_timeout,
                    redis::Script::new(SLIDING_WINDOW_SCRIPT)
                        .key(key)
                        .arg(window_start)
                        .arg(limit)
                        .arg(now)
                        .arg(member)
                        .arg(window_secs * 2)
                        .invoke_async::<(i64, i64, i64)>(&mut conn),
                )
                .await;

                match invocation {
                    Ok(Ok((allowed, count, oldest))) => {
                        if allowed == 1 {
                            Ok(LimitDecision::Allowed {
                                limit,
                                remaining: (limit - count).max(0),
                                reset_secs: window_secs,
                            })
                        } else {
                            // The oldest entry leaving the window frees a slot
                            let retry_after_secs = if oldest > 0 { (oldest + window_secs - now).max(1) } else { 1 };
                            Ok(LimitDecision::Limited { limit, retry_after_secs })
                        }
                    }
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("timed out".to_string()),
                }
            }
        };

        match result {
            Ok(decision) => decision,
            Err(reason) => {
                tracing::error!(key, %reason, "Rate limiter error, failing open");
                LimitDecision::Unavailable
            }
        }
    }
}

/// Per-target sliding window applied by the delivery worker before
/// dispatch. Fails open.
#[derive(Clone)]
pub struct TargetRateLimiter {
    limiter: RateLimiter,
    limit: i64,
    window_secs: i64,
}

impl TargetRateLimiter {
    pub fn new(limiter: RateLimiter, limit: i64, window_secs: i64) -> Self {
        Self { limiter, limit, window_secs }
    }

    pub fn disabled() -> Self {
        Self {
            limiter: RateLimiter::disabled(),
            limit: 10,
            window_secs: 60,
        }
    }

    /// Whether a send to this target may proceed right now.
    pub async fn allow(&self, target_url: &str) -> bool {
        match self
            .limiter
            .check(&target_key(target_url), self.limit, self.window_secs, RateLimitStrategy::SlidingWindow)
            .await
        {
            LimitDecision::Allowed { .. } | LimitDecision::Unavailable => true,
            LimitDecision::Limited { .. } => false,
        }
    }
}

/// Client identity: first hop of X-Forwarded-For, falling back to the
/// socket address.
fn client_identity(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
        && !first.trim().is_empty()
    {
        return first.trim().to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Request id echoed back for tracing across replicas.
fn request_id(request: &Request) -> String {
    request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string())
}

fn insert_header(response: &mut Response, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

async fn apply_limit(
    state: AppState,
    request: Request,
    next: Next,
    key: String,
    limit: i64,
    window_secs: i64,
    strategy: RateLimitStrategy,
) -> Response {
    let req_id = request_id(&request);

    match state.limiter.check(&key, limit, window_secs, strategy).await {
        LimitDecision::Allowed {
            limit,
            remaining,
            reset_secs,
        } => {
            let mut response = next.run(request).await;
            insert_header(&mut response, "x-rate-limit-limit", limit.to_string());
            insert_header(&mut response, "x-rate-limit-remaining", remaining.to_string());
            insert_header(&mut response, "x-rate-limit-reset", reset_secs.to_string());
            insert_header(&mut response, "x-request-id", req_id);
            response
        }
        LimitDecision::Limited { limit, retry_after_secs } => {
            tracing::info!(%key, limit, retry_after_secs, request_id = %req_id, "Rate limit exceeded");
            let body = json!({
                "detail": "Rate limit exceeded",
                "limit": limit,
                "window": format!("{window_secs} seconds"),
                "retry_after": retry_after_secs,
                "request_id": req_id,
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::response::Json(body)).into_response();
            insert_header(&mut response, "retry-after", retry_after_secs.to_string());
            insert_header(&mut response, "x-rate-limit-limit", limit.to_string());
            insert_header(&mut response, "x-rate-limit-remaining", "0".to_string());
            insert_header(&mut response, "x-request-id", req_id);
            response
        }
        LimitDecision::Unavailable => {
            // Fail open, but mark the response so operators can see it
            let mut response = next.run(request).await;
            insert_header(&mut response, "x-rate-limit-error", "1".to_string());
            insert_header(&mut response, "x-request-id", req_id);
            response
        }
    }
}

/// Default per-client, per-route limiter applied to the ingress.
pub async fn rate_limit_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let config = state.config.rate_limit.clone();
    if !config.enabled {
        return next.run(request).await;
    }

    let key = client_route_key(&client_identity(&request), request.uri().path());
    apply_limit(state, request, next, key, config.limit, config.window_secs, config.strategy).await
}

/// Stricter limiter for subscription creation. Uses the same atomic
/// fixed-window script with its own key space.
pub async fn subscription_create_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let config = state.config.rate_limit.clone();
    if !config.enabled {
        return next.run(request).await;
    }

    let key = format!("ratelimit:sub_create:{}", client_identity(&request));
    apply_limit(
        state,
        request,
        next,
        key,
        config.subscription_create_limit,
        config.subscription_create_window_secs,
        RateLimitStrategy::FixedWindow,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_keys_are_stable_and_bounded() {
        let a = client_route_key("10.0.0.1", "/api/v1/ingest/abc");
        let b = client_route_key("10.0.0.1", "/api/v1/ingest/abc");
        let c = client_route_key("10.0.0.1", "/api/v1/subscriptions");
        assert_eq!(a, b);
        assert_ne!(a, c);

        // "ratelimit:" + client + ":" + 8 hex chars
        let hash = a.rsplit(':').next().unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_target_key_is_full_md5() {
        let key = target_key("https://example.com/hook");
        let digest = key.strip_prefix("target_rate_limit:").unwrap();
        assert_eq!(digest.len(), 32);
    }

    #[test]
    fn test_scripts_are_single_atomic_evals() {
        // Both strategies check and mutate inside one script; the forbidden
        // two-step read-then-write pattern would show as separate calls.
        assert!(FIXED_WINDOW_SCRIPT.contains("HINCRBY"));
        assert!(FIXED_WINDOW_SCRIPT.contains("EXPIRE"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZADD"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("WITHSCORES"));
    }

    #[tokio::test]
    async fn test_disabled_limiter_fails_open() {
        let limiter = RateLimiter::disabled();
        let decision = limiter.check("ratelimit:test:abcd1234", 5, 60, RateLimitStrategy::FixedWindow).await;
        assert!(matches!(decision, LimitDecision::Unavailable));

        let target = TargetRateLimiter::disabled();
        assert!(target.allow("https://example.com/hook").await);
    }
}
