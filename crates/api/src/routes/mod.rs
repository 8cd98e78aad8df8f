//! HTTP route handlers.

pub mod health;
pub mod metrics;
pub mod repos;
pub mod subs;
