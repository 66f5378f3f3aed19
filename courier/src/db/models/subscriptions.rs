//! Database models for webhook subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::SubscriptionId;

/// Database model for a webhook subscription.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub target_url: String,
    pub secret: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a new subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionCreateDBRequest {
    pub target_url: String,
    pub secret: Option<String>,
    pub event_types: Option<Vec<String>>,
}

/// Request to update a subscription. `None` fields are left untouched;
/// the double-Option fields distinguish "don't change" from "set to NULL".
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdateDBRequest {
    pub target_url: Option<String>,
    pub secret: Option<Option<String>>,
    pub event_types: Option<Option<Vec<String>>>,
}
