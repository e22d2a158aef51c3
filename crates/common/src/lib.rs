//! Shared building blocks: configuration, errors, the notification model and
//! the broker/store collaborators every other crate talks through.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod redis_pool;
pub mod store;
pub mod types;
