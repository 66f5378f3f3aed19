//! Database models.

pub mod logs;
pub mod subscriptions;
pub mod tasks;

pub use logs::{DeliveryLog, LogCreateDBRequest, LogStatus};
pub use subscriptions::{Subscription, SubscriptionCreateDBRequest, SubscriptionUpdateDBRequest};
pub use tasks::{ClaimedTask, DeliveryTask, TaskCreateDBRequest, TaskStatus};
