use uuid::Uuid;

/// Subscription ID type alias for type safety.
pub type SubscriptionId = Uuid;

/// Delivery task ID type alias for type safety.
pub type TaskId = Uuid;

/// Delivery log ID type alias for type safety.
pub type LogId = Uuid;

/// Abbreviate a UUID for tracing fields (first segment only).
pub fn abbrev_uuid(id: &Uuid) -> String {
    let s = id.to_string();
    s.split('-').next().unwrap_or(&s).to_string()
}
