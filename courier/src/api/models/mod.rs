//! API request and response models.

pub mod deliveries;
pub mod subscriptions;
