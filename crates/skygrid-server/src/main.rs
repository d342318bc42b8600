//! Skygrid server binary: configuration, wiring, and the HTTP listener.

use anyhow::Result;
use skygrid_core::clock::SystemClock;
use skygrid_server::config::Config;
use skygrid_server::driver::{FleetDriver, SimDriver};
use skygrid_server::persistence::SqliteStore;
use skygrid_server::state::Core;
use skygrid_server::api;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("Invalid configuration: {}", error);
        }
        std::process::exit(2);
    }

    if let Err(err) = run(config).await {
        tracing::error!("Startup failed: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!("Starting Skygrid coordination service...");

    let persistence =
        SqliteStore::init(&config.database_path, config.database_max_connections).await?;
    let clock = Arc::new(SystemClock);
    let driver = SimDriver::new(config.coordination.max_drones, clock.clone());
    tracing::info!("Fleet inventory: {} vehicle(s)", driver.vehicle_ids().len());

    let port = config.port;
    let core = Arc::new(Core::new(
        config,
        driver.clone(),
        Arc::new(persistence),
        clock,
    ));

    // Replay persisted missions before any admission can race them.
    core.registry.restore().await?;

    driver.spawn(core.shutdown_signal());
    core.spawn_loops();

    let app = api::routes()
        .with_state(core.clone())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    core.shutdown().await;
    tracing::info!("Clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
