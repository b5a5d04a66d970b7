use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod kiosk;
mod vision;

use config::{Bus, Config};
use dbus_interface::{PickupService, BUS_NAME, OBJECT_PATH};
use engine::ModeController;
use kiosk::Kiosk;
use pickup_store::RecordStore;
use vision::VisionClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("pickupd starting");

    let config = Config::load().context("failed to load configuration")?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = RecordStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    tracing::info!(db = %config.db_path.display(), "record store opened");

    let kiosk = Arc::new(Kiosk::new(store, config.kiosk_settings()));
    kiosk.integrity_check().await?;

    let connection = match config.bus {
        Bus::Session => zbus::Connection::session().await,
        Bus::System => zbus::Connection::system().await,
    }
    .context("failed to connect to D-Bus")?;

    let vision = Arc::new(VisionClient::connect(&connection).await?);
    let controller = Arc::new(ModeController::new(vision, Arc::clone(&kiosk), config.loop_timing()));

    connection
        .object_server()
        .at(OBJECT_PATH, PickupService::new(kiosk, Arc::clone(&controller)))
        .await?;
    connection
        .request_name(BUS_NAME)
        .await
        .with_context(|| format!("failed to acquire bus name {BUS_NAME}"))?;

    controller.switch_mode(config.start_mode).await;
    tracing::info!(bus = ?config.bus, mode = %config.start_mode, "pickupd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("pickupd shutting down");
    controller.stop().await;

    Ok(())
}
