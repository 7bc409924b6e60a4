//! A small service that serves bars from the foo API through a Postgres
//! backed read-through cache, with its dependencies supervised by a
//! [`health::HealthRegistry`].

pub mod backends;
pub mod client;
pub mod config;
pub mod dal;
pub mod deps;
pub mod error;
pub mod metrics;
pub mod router;
