//! HTTP submission surface for producers that cannot link the notifier crate.
//!
//! Endpoints:
//! - GET    /health
//! - POST   /api/notifications
//! - POST   /api/notifications/{external_key}/trigger
//! - DELETE /api/notifications/{external_key}

pub mod routes;
pub mod state;
