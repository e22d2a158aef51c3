//! HookRelay API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use hookrelay_common::broker::RedisConnector;
use hookrelay_common::config::AppConfig;
use hookrelay_common::db::{create_pool, run_migrations};
use hookrelay_common::store::PgNotifyStore;
use hookrelay_notifier::NotifyAgent;

use hookrelay_api::routes::create_router;
use hookrelay_api::state::AppState;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("hookrelay_api=debug,hookrelay_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting HookRelay API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    // Open the broker connection used for submissions
    let connector = RedisConnector::new(&config.redis_url)?;
    let agent = NotifyAgent::connect(&connector, Arc::new(PgNotifyStore::new(pool))).await?;
    tracing::info!("Broker connection established");

    let state = AppState::new(agent);

    // Build router
    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
