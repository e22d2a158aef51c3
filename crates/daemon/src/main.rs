use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use hookrelay_common::broker::RedisConnector;
use hookrelay_common::config::AppConfig;
use hookrelay_common::db;
use hookrelay_common::store::PgNotifyStore;
use hookrelay_daemon::{Supervisor, SupervisorConfig};
use hookrelay_notifier::delivery::DeliveryEngine;
use hookrelay_notifier::transport::{ReqwestTransport, TransportConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first: NOTIFY_DEBUG decides the default filter
    let config = AppConfig::from_env()?;

    let default_filter = if config.debug {
        "hookrelay_daemon=debug,hookrelay_notifier=debug,hookrelay_common=debug,notify_agent=info"
    } else {
        "hookrelay_daemon=info,hookrelay_notifier=info,notify_agent=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .json()
        .init();

    tracing::info!("HookRelay daemon starting...");

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;

    db::run_migrations(&pool).await?;

    let connector = Arc::new(RedisConnector::new(&config.redis_url)?);
    let store = Arc::new(PgNotifyStore::new(pool));
    let transport = Arc::new(ReqwestTransport::new(TransportConfig {
        verify_tls: config.verify_tls,
        ..TransportConfig::default()
    })?);

    let supervisor = Supervisor::new(
        connector,
        store,
        DeliveryEngine::new(transport),
        SupervisorConfig::from(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signals");
            return;
        }
        tracing::info!("Received shutdown signal, stopping gracefully...");
        shutdown_tx.send_replace(true);
    });

    let exit = supervisor.run(shutdown_rx).await;

    tracing::info!(code = exit.code(), "HookRelay daemon stopped.");
    std::process::exit(exit.code());
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
        _ = user1.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
