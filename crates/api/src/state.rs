//! Shared application state for the Axum API server.

use std::sync::Arc;

use hookrelay_notifier::NotifyAgent;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<NotifyAgent>,
}

impl AppState {
    pub fn new(agent: NotifyAgent) -> Self {
        Self {
            agent: Arc::new(agent),
        }
    }
}
