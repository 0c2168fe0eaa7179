//! AgriSense link gateway binary
//!
//! This service:
//! - Opens the NPK sensor and tank controller serial links from config
//! - Runs their read loops, decoding lines into the telemetry store
//! - Falls back to demo mode when no hardware is reachable
//! - Runs the hybrid simulation scheduler
//! - Logs every store change as a structured snapshot for the dashboard

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};

use agrisense_link::config::Config;
use agrisense_link::manager::ConnectionManager;
use agrisense_link::simulation::SimulationScheduler;
use agrisense_link::telemetry::TelemetryStore;
use agrisense_link::transport::SerialFactory;

/// Log the store on every change; stands in for the dashboard consumer.
async fn watch_telemetry(store: Arc<TelemetryStore>) {
    let mut rx = store.subscribe();
    while rx.changed().await.is_ok() {
        let snapshot = store.snapshot();
        info!(
            n = snapshot.nutrients.n,
            p = snapshot.nutrients.p,
            k = snapshot.nutrients.k,
            temperature = snapshot.environment.temperature,
            humidity = snapshot.environment.humidity,
            methane = snapshot.environment.methane,
            ph = snapshot.environment.ph,
            sensor = snapshot.sensor_connected,
            controller = snapshot.controller_connected,
            demo = snapshot.demo_mode,
            last_command = snapshot.last_command.as_deref().unwrap_or(""),
            "telemetry"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("AgriSense link gateway starting");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    info!("Configuration loaded successfully");

    let store = Arc::new(TelemetryStore::new());
    let factory = Arc::new(SerialFactory::new(
        config.sensor.clone(),
        config.controller.clone(),
    ));
    let manager = Arc::new(ConnectionManager::new(Arc::clone(&store), factory));

    let scheduler = SimulationScheduler::new(
        Arc::clone(&store),
        Duration::from_secs(config.simulation.interval_secs),
        Duration::from_secs(config.simulation.staleness_secs),
    );
    tokio::spawn(scheduler.run());
    tokio::spawn(watch_telemetry(Arc::clone(&store)));

    // Denied/Busy are reported and non-fatal; the gateway keeps running and
    // the dashboard can retry or switch to demo mode.
    if let Err(err) = manager.open_sensor_link().await {
        warn!(error = %err, "NPK sensor link unavailable");
    }
    if let Err(err) = manager.open_controller_link().await {
        warn!(error = %err, "tank controller link unavailable");
    }

    let snapshot = store.snapshot();
    if !snapshot.sensor_connected && !snapshot.controller_connected {
        info!("no hardware reachable, enabling demo mode");
        manager.enable_demo_mode().await;
    }

    info!("Gateway running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    manager.close_sensor_link().await;
    manager.close_controller_link().await;

    Ok(())
}
