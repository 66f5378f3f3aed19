//! Database layer: models and repositories over PostgreSQL.
//!
//! Repositories hold a `&mut PgConnection` so callers decide whether an
//! operation runs on a pool connection or inside a transaction.

pub mod errors;
pub mod handlers;
pub mod models;
