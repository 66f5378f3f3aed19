//! Database repository for webhook subscriptions.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::subscriptions::{Subscription, SubscriptionCreateDBRequest, SubscriptionUpdateDBRequest};
use crate::types::{SubscriptionId, abbrev_uuid};

/// Repository for subscription operations.
pub struct Subscriptions<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Subscriptions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Create a new subscription.
    #[instrument(skip(self, request), err)]
    pub async fn create(&mut self, request: &SubscriptionCreateDBRequest) -> Result<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (target_url, secret, event_types)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(&request.target_url)
        .bind(&request.secret)
        .bind(&request.event_types)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(subscription)
    }

    /// Get a subscription by ID.
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(subscription)
    }

    /// Get a subscription by ID, but only if it accepts the given event type.
    ///
    /// The event-type filter runs in the query itself: a NULL `event_types`
    /// accepts every event, otherwise the type must be a member of the array.
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id), event_type), err)]
    pub async fn get_for_event(&mut self, id: SubscriptionId, event_type: &str) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE id = $1
              AND (event_types IS NULL OR $2 = ANY(event_types))
            "#,
        )
        .bind(id)
        .bind(event_type)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(subscription)
    }

    /// Check whether a subscription exists at all.
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    pub async fn exists(&mut self, id: SubscriptionId) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM subscriptions WHERE id = $1)")
            .bind(id)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(exists)
    }

    /// List subscriptions with pagination, newest first.
    #[instrument(skip(self), err)]
    pub async fn list(&mut self, skip: i64, limit: i64) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            ORDER BY created_at DESC
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(skip)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(subscriptions)
    }

    /// Update a subscription, bumping `updated_at`.
    #[instrument(skip(self, request), fields(subscription_id = %abbrev_uuid(&id)), err)]
    pub async fn update(&mut self, id: SubscriptionId, request: &SubscriptionUpdateDBRequest) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET
                target_url = COALESCE($2, target_url),
                secret = CASE WHEN $3 THEN $4 ELSE secret END,
                event_types = CASE WHEN $5 THEN $6 ELSE event_types END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.target_url)
        .bind(request.secret.is_some())
        .bind(request.secret.clone().flatten())
        .bind(request.event_types.is_some())
        .bind(request.event_types.clone().flatten())
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(subscription)
    }

    /// Delete a subscription. Tasks and logs cascade.
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    pub async fn delete(&mut self, id: SubscriptionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
