pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod observability;
pub mod persistence;
