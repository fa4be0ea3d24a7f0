//! Greenbox Sensors - hub of the zone sensors
//!
//! Runs one worker per sensor declared in the catalog:
//! - reads its measurements every TIME_INTERVAL_SENSORS seconds
//! - publishes on `/<gh>/<rb>/sensors/<device>/<metric>`
//! - has its own bus client subscribed to `/<gh>/<rb>/actuators/+/+/data`,
//!   and adds the latest actuator deltas to every value it reads

mod deltas;
mod hub;
mod reader;
mod sensor;

use crate::hub::SensorHub;
use crate::reader::{SensorReader, SimulatedReader};
use anyhow::{bail, Context, Result};
use greenbox_kernel::catalog::{load_catalog, SensorDevice};
use greenbox_kernel::config::GreenboxConfig;
use greenbox_kernel::logging;
use greenbox_kernel::threshold::ThresholdMap;
use std::time::Duration;
use tracing::info;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = GreenboxConfig::from_env().context("invalid configuration")?;
    logging::init_tracing("greenbox-sensors");

    let catalog = load_catalog(&config.catalog).await.context("catalog unavailable")?;
    let mut devices = catalog.sensors();
    if let Some(wanted) = &config.device_filter {
        devices.retain(|d| &d.device_id == wanted);
        if devices.is_empty() {
            bail!("sensor '{wanted}' not found in catalog");
        }
    }

    let empty = ThresholdMap::default();
    let make_reader = |device: &SensorDevice| -> Box<dyn SensorReader> {
        let thresholds = catalog.thresholds(&device.zone.greenhouse_id).unwrap_or(&empty);
        Box::new(SimulatedReader::from_thresholds(thresholds))
    };

    let mut hub = SensorHub::start(devices, catalog.broker(), config.sensor_interval, make_reader)
        .await
        .context("cannot start sensor hub")?;
    if hub.is_empty() {
        tracing::warn!("no sensor declared in catalog");
    }
    info!(sensors = hub.len(), period_s = config.sensor_interval.as_secs_f64(), "sensors running");

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    info!("shutdown requested");
    hub.stop(SHUTDOWN_TIMEOUT).await;
    info!("sensors stopped");
    Ok(())
}
