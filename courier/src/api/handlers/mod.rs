//! HTTP request handlers.

pub mod deliveries;
pub mod ingest;
pub mod subscriptions;
