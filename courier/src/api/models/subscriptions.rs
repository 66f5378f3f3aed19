//! API models for the subscription management surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::db::models::subscriptions::{Subscription, SubscriptionCreateDBRequest, SubscriptionUpdateDBRequest};
use crate::errors::Error;
use crate::types::SubscriptionId;

/// Deserialize a field that distinguishes "absent" from "explicitly null".
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Request body for creating a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionCreate {
    pub target_url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
}

impl SubscriptionCreate {
    pub fn into_db_request(self) -> Result<SubscriptionCreateDBRequest, Error> {
        validate_target_url(&self.target_url)?;
        Ok(SubscriptionCreateDBRequest {
            target_url: self.target_url,
            secret: self.secret,
            event_types: self.event_types,
        })
    }
}

/// Request body for updating a subscription. Omitted fields are left
/// untouched; `secret` and `event_types` accept an explicit null to clear.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub secret: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub event_types: Option<Option<Vec<String>>>,
}

impl SubscriptionUpdate {
    pub fn into_db_request(self) -> Result<SubscriptionUpdateDBRequest, Error> {
        if let Some(ref target_url) = self.target_url {
            validate_target_url(target_url)?;
        }
        Ok(SubscriptionUpdateDBRequest {
            target_url: self.target_url,
            secret: self.secret,
            event_types: self.event_types,
        })
    }
}

/// Subscription resource as returned by the API. The secret never leaves
/// the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub id: SubscriptionId,
    pub target_url: String,
    pub event_types: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(subscription: Subscription) -> Self {
        Self {
            id: subscription.id,
            target_url: subscription.target_url,
            event_types: subscription.event_types,
            created_at: subscription.created_at,
            updated_at: subscription.updated_at,
        }
    }
}

/// Pagination query parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// Query parameter for delivery-log listings.
#[derive(Debug, Clone, Deserialize)]
pub struct LogListParams {
    #[serde(default = "default_log_limit")]
    pub limit: i64,
}

fn default_log_limit() -> i64 {
    20
}

/// Target URLs must be absolute http(s) URLs with a host.
fn validate_target_url(target_url: &str) -> Result<(), Error> {
    let parsed = Url::parse(target_url).map_err(|_| Error::BadRequest {
        message: format!("Invalid target URL: {target_url}"),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(Error::BadRequest {
            message: "Target URL must be an absolute http or https URL".to_string(),
        });
    }

    Ok(())
}
