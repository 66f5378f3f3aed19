//! Database models for delivery tasks and their retry state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{SubscriptionId, TaskId};

/// Lifecycle status of a delivery task.
///
/// `Completed` and `Failed` are terminal; a `Pending` task with a null or
/// past `next_attempt_at` is eligible for claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_task_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Database model for a delivery task.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeliveryTask {
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

impl DeliveryTask {
    /// Whether the task is eligible for an attempt right now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// Request to create a new delivery task.
#[derive(Debug, Clone)]
pub struct TaskCreateDBRequest {
    pub subscription_id: SubscriptionId,
    pub payload: serde_json::Value,
    pub event_type: Option<String>,
    pub max_retries: i32,
}

/// Snapshot of a task taken at claim time, used by the worker after the
/// claim transaction commits.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub subscription_id: SubscriptionId,
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    pub max_retries: i32,
}
