//! Herald API server binary entrypoint.

use std::sync::Arc;

use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::{create_pool, run_migrations};
use herald_engine::store::PgQueueStore;
use herald_notifier::build_sender;

use herald_api::routes::create_router;
use herald_api::state::AppState;

/// Largest accepted request body (webhooks included).
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=debug,herald_notifier=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database pool created and migrations applied");

    // Build application state
    let sender = build_sender(&config)?;
    let state = AppState::new(Arc::new(PgQueueStore::new(pool)), sender, config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch_handle = if config.dispatch_enabled {
        let dispatcher = state.dispatcher.clone();
        Some(tokio::spawn(async move { dispatcher.run(shutdown_rx).await }))
    } else {
        tracing::info!("Background dispatch disabled, use the manual trigger");
        None
    };

    // Build router
    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.api_bind_addr).await?;
    tracing::info!("API server listening on {}", config.api_bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = dispatch_handle
        && let Err(e) = handle.await
    {
        tracing::error!(error = %e, "Dispatcher task ended abnormally");
    }

    tracing::info!("Herald API server stopped.");
    Ok(())
}
