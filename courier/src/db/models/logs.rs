//! Database models for delivery attempt logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{LogId, SubscriptionId, TaskId};

/// Outcome classification of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_log_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    /// 2xx response from the target.
    Success,
    /// Retryable failure; another attempt will follow.
    FailedAttempt,
    /// Terminal failure (retries exhausted or non-retryable).
    Failure,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::FailedAttempt => "FAILED_ATTEMPT",
            Self::Failure => "FAILURE",
        }
    }
}

/// Append-only record of a single delivery attempt.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeliveryLog {
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

/// Request to record one delivery attempt.
#[derive(Debug, Clone)]
pub struct LogCreateDBRequest {
    pub delivery_task_id: TaskId,
    pub subscription_id: SubscriptionId,
    pub target_url: String,
    pub attempt_number: i32,
    pub status: LogStatus,
    pub status_code: Option<i32>,
    pub error_details: Option<String>,
}
