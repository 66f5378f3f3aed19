//! API models for delivery tasks and their attempt logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::logs::{DeliveryLog, LogStatus};
use crate::db::models::tasks::{DeliveryTask, TaskStatus};
use crate::types::{LogId, SubscriptionId, TaskId};

/// Delivery task resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: TaskId,
    pub subscription_id: SubscriptionId,
    pub payload: serde_json::Value,
    pub event_type: Option<String>,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub max_retries: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeliveryTask> for TaskResponse {
    fn from(task: DeliveryTask) -> Self {
        Self {
            id: task.id,
            subscription_id: task.subscription_id,
            payload: task.payload,
            event_type: task.event_type,
            status: task.status,
            attempt_count: task.attempt_count,
            max_retries: task.max_retries,
            next_attempt_at: task.next_attempt_at,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// One delivery attempt as exposed by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogResponse {
    pub id: LogId,
    pub delivery_task_id: TaskId,
    pub subscription_id: SubscriptionId,
    pub target_url: String,
    pub attempt_number: i32,
    pub status: LogStatus,
    pub status_code: Option<i32>,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<DeliveryLog> for LogResponse {
    fn from(log: DeliveryLog) -> Self {
        Self {
            id: log.id,
            delivery_task_id: log.delivery_task_id,
            subscription_id: log.subscription_id,
            target_url: log.target_url,
            attempt_number: log.attempt_number,
            status: log.status,
            status_code: log.status_code,
            error_details: log.error_details,
            created_at: log.created_at,
        }
    }
}

/// A task together with its attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWithLogsResponse {
    #[serde(flatten)]
    pub task: TaskResponse,
    pub logs: Vec<LogResponse>,
}

/// Plain message body, used for ignored events and deletions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}
