//! HTTP handler for delivery task status.

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::instrument;

use crate::{
    AppState,
    api::models::deliveries::TaskWithLogsResponse,
    db::handlers::{Logs, Tasks},
    errors::{Error, Result},
    types::TaskId,
};

/// `GET /api/v1/deliveries/{task_id}` — the task and its attempt history,
/// ordered by attempt number.
#[instrument(skip_all, fields(task_id = %task_id))]
pub async fn get_delivery(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> Result<Json<TaskWithLogsResponse>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;

    let task = Tasks::new(&mut conn).get_by_id(task_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Delivery task".to_string(),
        id: task_id.to_string(),
    })?;

    let logs = Logs::new(&mut conn).list_by_task(task_id).await?;

    Ok(Json(TaskWithLogsResponse {
        task: task.into(),
        logs: logs.into_iter().map(Into::into).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Subscriptions;
    use crate::db::models::logs::{LogCreateDBRequest, LogStatus};
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use crate::db::models::tasks::TaskCreateDBRequest;
    use crate::test_utils::{test_server, test_state};
    use axum::http::StatusCode;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_get_delivery_with_logs(pool: PgPool) {
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
                payload: serde_json::json!({"k": "v"}),
                event_type: Some("order.created".to_string()),
                max_retries: 5,
            })
            .await
            .unwrap();
        Logs::new(&mut conn)
            .create(&LogCreateDBRequest {
                delivery_task_id: task.id,
                subscription_id: subscription.id,
                target_url: subscription.target_url.clone(),
                attempt_number: 1,
                status: LogStatus::Success,
                status_code: Some(200),
                error_details: None,
            })
            .await
            .unwrap();
        drop(conn);

        let server = test_server(test_state(pool.clone()));
        let response = server.get(&format!("/api/v1/deliveries/{}", task.id)).await;

        response.assert_status_ok();
        let body: TaskWithLogsResponse = response.json();
        assert_eq!(body.task.id, task.id);
        assert_eq!(body.task.event_type.as_deref(), Some("order.created"));
        assert_eq!(body.logs.len(), 1);
        assert_eq!(body.logs[0].status, LogStatus::Success);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_unknown_delivery_is_404(pool: PgPool) {
        let server = test_server(test_state(pool.clone()));
        server
            .get(&format!("/api/v1/deliveries/{}", uuid::Uuid::new_v4()))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
