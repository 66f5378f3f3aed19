//! HTTP handlers for the subscription management surface.
//!
//! Every mutation invalidates the cache before the response is returned,
//! so a read that follows a mutation sees the new record or a miss, never
//! the stale record.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::instrument;

use crate::{
    AppState,
    api::models::deliveries::{LogResponse, MessageResponse},
    api::models::subscriptions::{LogListParams, Pagination, SubscriptionCreate, SubscriptionResponse, SubscriptionUpdate},
    db::handlers::{Logs, Subscriptions},
    errors::{Error, Result},
    types::SubscriptionId,
};

fn not_found(id: SubscriptionId) -> Error {
    Error::NotFound {
        resource: "Subscription".to_string(),
        id: id.to_string(),
    }
}

/// `POST /api/v1/subscriptions`
#[instrument(skip_all)]
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionCreate>,
) -> Result<(StatusCode, Json<SubscriptionResponse>)> {
    let db_request = request.into_db_request()?;

    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let subscription = Subscriptions::new(&mut conn).create(&db_request).await?;
    drop(conn);

    // Write through the cache so the first delivery does not pay a miss
    state.cache.put(&subscription).await;

    tracing::info!(subscription_id = %subscription.id, "Subscription created");
    Ok((StatusCode::CREATED, Json(subscription.into())))
}

/// `GET /api/v1/subscriptions`
#[instrument(skip_all)]
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<Vec<SubscriptionResponse>>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let subscriptions = Subscriptions::new(&mut conn)
        .list(pagination.skip.max(0), pagination.limit.clamp(1, 1000))
        .await?;

    Ok(Json(subscriptions.into_iter().map(Into::into).collect()))
}

/// `GET /api/v1/subscriptions/{id}`
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn get_subscription(State(state): State<AppState>, Path(id): Path<SubscriptionId>) -> Result<Json<SubscriptionResponse>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let subscription = Subscriptions::new(&mut conn)
        .get_by_id(id)
        .await?
        .ok_or_else(|| not_found(id))?;

    Ok(Json(subscription.into()))
}

/// `PUT /api/v1/subscriptions/{id}`
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    Json(request): Json<SubscriptionUpdate>,
) -> Result<Json<SubscriptionResponse>> {
    let db_request = request.into_db_request()?;

    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let subscription = Subscriptions::new(&mut conn)
        .update(id, &db_request)
        .await?
        .ok_or_else(|| not_found(id))?;
    drop(conn);

    // Invalidate before responding: workers must never act on the old
    // record once the caller has seen this response succeed.
    state.cache.invalidate(id).await;

    tracing::info!(subscription_id = %id, "Subscription updated");
    Ok(Json(subscription.into()))
}

/// `DELETE /api/v1/subscriptions/{id}`
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn delete_subscription(State(state): State<AppState>, Path(id): Path<SubscriptionId>) -> Result<Json<MessageResponse>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let deleted = Subscriptions::new(&mut conn).delete(id).await?;
    drop(conn);

    if !deleted {
        return Err(not_found(id));
    }

    state.cache.invalidate(id).await;

    tracing::info!(subscription_id = %id, "Subscription deleted");
    Ok(Json(MessageResponse {
        message: "Subscription deleted successfully".to_string(),
    }))
}

/// `GET /api/v1/subscriptions/{id}/deliveries`
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn list_subscription_deliveries(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    Query(params): Query<LogListParams>,
) -> Result<Json<Vec<LogResponse>>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;

    if !Subscriptions::new(&mut conn).exists(id).await? {
        return Err(not_found(id));
    }

    let logs = Logs::new(&mut conn)
        .list_recent_by_subscription(id, params.limit.clamp(1, 500))
        .await?;

    Ok(Json(logs.into_iter().map(Into::into).collect()))
}
