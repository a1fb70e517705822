//! Buckets: the per-bucket object engine and the registry that owns them.

pub mod client;
pub mod manager;
