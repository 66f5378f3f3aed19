//! Database repositories.

pub mod logs;
pub mod subscriptions;
pub mod tasks;

pub use logs::Logs;
pub use subscriptions::Subscriptions;
pub use tasks::Tasks;
