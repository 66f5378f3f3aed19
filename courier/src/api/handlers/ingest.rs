//! Ingestion endpoint: accept a webhook payload and queue it for delivery.
//!
//! Synchronous-return, asynchronous-effect: a 202 means the payload was
//! validated and a delivery task persisted, not that the target received
//! anything. Delivery outcome is visible through the task status surface.

use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::StreamExt;
use metrics::counter;
use tracing::instrument;

use crate::{
    AppState,
    api::models::deliveries::{MessageResponse, TaskResponse},
    db::handlers::{Subscriptions, Tasks},
    db::models::subscriptions::Subscription,
    db::models::tasks::TaskCreateDBRequest,
    errors::{Error, Result},
    signing,
    types::SubscriptionId,
};

/// `POST /api/v1/ingest/{subscription_id}`
///
/// Optional headers: `X-Event-Type` (filtering) and `X-Webhook-Signature`
/// (hex HMAC-SHA256 of the raw body under the subscription secret).
#[instrument(skip_all, fields(subscription_id = %subscription_id))]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(subscription_id): Path<SubscriptionId>,
    request: Request,
) -> Result<Response> {
    let max_payload_size = state.config.webhook.max_payload_size;
    let headers = request.headers().clone();

    // Reject on the declared length before reading anything.
    if let Some(length) = content_length(&headers)
        && length > max_payload_size as u64
    {
        return Err(Error::PayloadTooLarge {
            max_bytes: max_payload_size,
        });
    }

    // Stream the body in chunks and abort the moment the cap is crossed,
    // so an unbounded (or lying) sender never gets buffered past the cap.
    let raw_body = read_body_capped(request, max_payload_size).await?;

    let event_type = header_str(&headers, signing::EVENT_TYPE_HEADER);
    let signature = header_str(&headers, signing::SIGNATURE_HEADER);

    // Resolve the subscription, applying the event-type predicate in the
    // query when a type is present.
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let mut repo = Subscriptions::new(&mut conn);

    let subscription: Subscription = match event_type {
        Some(ref event_type) => match repo.get_for_event(subscription_id, event_type).await? {
            Some(subscription) => subscription,
            None => {
                if !repo.exists(subscription_id).await? {
                    return Err(Error::NotFound {
                        resource: "Subscription".to_string(),
                        id: subscription_id.to_string(),
                    });
                }
                // The subscription exists but does not want this event type
                tracing::debug!(%event_type, "Event type filtered out");
                counter!("courier_ingest_total", "outcome" => "ignored").increment(1);
                return Ok((
                    StatusCode::OK,
                    axum::Json(MessageResponse {
                        message: format!("Ignored event type: {event_type}"),
                    }),
                )
                    .into_response());
            }
        },
        None => repo.get_by_id(subscription_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Subscription".to_string(),
            id: subscription_id.to_string(),
        })?,
    };

    // Signature verification is optional at the protocol level: it runs
    // only when both a secret and a signature are present.
    if let Some(ref secret) = subscription.secret
        && let Some(ref signature) = signature
        && !signing::verify_signature(&raw_body, signature, secret)
    {
        counter!("courier_ingest_total", "outcome" => "bad_signature").increment(1);
        return Err(Error::InvalidSignature);
    }

    let payload: serde_json::Value = serde_json::from_slice(&raw_body).map_err(|_| Error::BadRequest {
        message: "Invalid JSON payload".to_string(),
    })?;

    let task = Tasks::new(&mut conn)
        .create(&TaskCreateDBRequest {
            subscription_id,
            payload,
            event_type,
            max_retries: state.config.webhook.max_retries,
        })
        .await?;
    drop(conn);

    // Enqueue is fail-open: the task row is durable and the maintenance
    // sweep re-enqueues anything whose message is lost.
    if !state.queue.push(task.id).await {
        tracing::warn!(task_id = %task.id, "Task accepted but not enqueued; maintenance sweep will pick it up");
    }

    counter!("courier_ingest_total", "outcome" => "accepted").increment(1);
    tracing::info!(task_id = %task.id, "Webhook accepted for delivery");

    Ok((StatusCode::ACCEPTED, axum::Json(TaskResponse::from(task))).into_response())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}

/// Accumulate the request body, failing with 413 as soon as more than
/// `max_bytes` have been read.
async fn read_body_capped(request: Request, max_bytes: usize) -> Result<bytes::Bytes> {
    let mut stream = request.into_body().into_data_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::BadRequest {
            message: format!("Failed to read request body: {e}"),
        })?;

        if buffer.len() + chunk.len() > max_bytes {
            return Err(Error::PayloadTooLarge { max_bytes });
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(buffer.freeze())
}
