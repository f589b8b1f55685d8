//! Courier outbound delivery service.
//!
//! Main entry point. Loads configuration, prepares the database, starts the
//! delivery worker and the HTTP API, and tears everything down in reverse
//! order on shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{AppState, Config};
use courier_core::{MetricsRegistry, RealClock, Storage};
use courier_delivery::{DeliveryEngine, HttpTransport, PostgresQueueStorage};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        routes = config.routes.len(),
        chaos_enabled = config.chaos_enabled,
        "Configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(pool.clone()));
    storage.migrate().await.context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let transport = HttpTransport::new(&config.to_transport_config())
        .context("Failed to build outbound HTTP client")?;
    let engine = Arc::new(
        DeliveryEngine::new(
            config.to_delivery_config(),
            Arc::new(PostgresQueueStorage::new(storage.clone())),
            Arc::new(transport),
            Arc::new(RealClock::new()),
            Arc::new(MetricsRegistry::new()),
        )
        .context("Failed to build delivery engine")?,
    );
    engine.start().await;

    let state = AppState::new(storage, engine.clone()).with_config(&config);
    let addr = config.parse_server_addr()?;
    let request_timeout = Duration::from_secs(config.request_timeout_seconds);

    info!(addr = %addr, "Courier is ready to accept events");

    if let Err(e) = courier_api::start_server(state, addr, request_timeout).await {
        error!(error = %e, "Server failed");
    }

    engine.stop().await;
    info!("Delivery worker stopped");

    pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < config.database_connect_retries => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = config.database_connect_retries,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
