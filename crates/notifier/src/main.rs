use std::sync::Arc;

use tokio::sync::watch;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_engine::store::PgQueueStore;
use herald_notifier::build_sender;
use herald_notifier::dispatcher::{Dispatcher, DispatcherConfig};
use herald_notifier::template::PlaceholderRenderer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    let sender = build_sender(&config)?;
    let dispatcher = Dispatcher::new(
        Arc::new(PgQueueStore::new(pool)),
        sender,
        Arc::new(PlaceholderRenderer),
        DispatcherConfig::from_app_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal, stopping gracefully...");
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await;

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
