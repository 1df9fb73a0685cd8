use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plant_telemetry::{
    aggregation::AggregationService,
    api,
    config::{Config, StoreKind},
    db,
    store::{InMemoryStore, MeasurementStore, PgStore, ReferenceData},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Env vars may also be set externally
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn MeasurementStore> = match config.store {
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            let pool = db::create_pool(url, config.database_max_connections).await?;
            db::run_migrations(&pool).await?;
            info!("Database ready");
            Arc::new(PgStore::new(pool))
        }
        StoreKind::Memory => {
            warn!("Using the in-memory store; measurements are lost on restart");
            let path = config
                .plants_file
                .as_deref()
                .context("PLANTS_FILE is required for the memory store")?;
            let store = InMemoryStore::new();
            store.seed(ReferenceData::load(path)?).await;
            Arc::new(store)
        }
    };

    info!(
        offset = %config.time_zone_offset,
        daylight_start = config.rollup.daylight_start_hour,
        daylight_end = config.rollup.daylight_end_hour,
        "Rollup configured"
    );
    let service = Arc::new(AggregationService::new(
        store,
        config.time_zone_offset,
        config.rollup,
    ));

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, api::router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
