//! Greenbox Actuators - simulated actuators of every zone
//!
//! One actuator per device declared in the catalog:
//! - listens on `/<gh>/<rb>/actuators/<system>/cmd`
//! - while on, publishes its effects on `/<gh>/<rb>/actuators/<system>/<id>/data`
//!   every ACTUATOR_PUBLISH_PERIOD_S seconds
//! - one bus client per actuator; on shutdown each is turned OFF first,
//!   then unsubscribed and disconnected

mod actuator;
mod connector;

use crate::connector::ActuatorConnector;
use anyhow::{bail, Context, Result};
use greenbox_kernel::catalog::load_catalog;
use greenbox_kernel::config::GreenboxConfig;
use greenbox_kernel::logging;
use std::time::Duration;
use tracing::info;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = GreenboxConfig::from_env().context("invalid configuration")?;
    logging::init_tracing("greenbox-actuators");

    let catalog = load_catalog(&config.catalog).await.context("catalog unavailable")?;
    let mut devices = catalog.actuators();
    if let Some(wanted) = &config.device_filter {
        devices.retain(|d| &d.device_id == wanted);
        if devices.is_empty() {
            bail!("actuator '{wanted}' not found in catalog");
        }
    }

    let mut connector = ActuatorConnector::start(
        devices,
        catalog.broker(),
        config.actuator_publish_period,
        |device| catalog.effects(&device.zone.greenhouse_id),
    )
    .await
    .context("cannot start actuators")?;
    info!(
        actuators = connector.len(),
        period_s = config.actuator_publish_period.as_secs_f64(),
        "actuators running"
    );

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    info!("shutdown requested");
    connector.stop(SHUTDOWN_TIMEOUT).await;
    info!("actuators stopped");
    Ok(())
}
