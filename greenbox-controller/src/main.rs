//! Greenbox Controller - reactive controller of the greenhouse zones
//!
//! Listens to `/+/+/statistics/state` snapshots and decides:
//! - actuator levels (main optimizer)
//! - illumination (light optimizer)
//! - pH alerts
//!
//! Purely reactive, no timer. Snapshots go through a bounded queue to a
//! single task that drives the zone cache.

mod dispatcher;
mod light;
mod optimizer;
mod ph;

use crate::dispatcher::Controller;
use crate::optimizer::Weights;
use anyhow::{Context, Result};
use greenbox_kernel::bus::{BusClient, BusOptions, MessageHandler};
use greenbox_kernel::catalog::load_catalog;
use greenbox_kernel::config::GreenboxConfig;
use greenbox_kernel::{logging, topics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const SNAPSHOT_QUEUE: usize = 256;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = GreenboxConfig::from_env().context("invalid configuration")?;
    logging::init_tracing("greenbox-controller");

    let catalog = load_catalog(&config.catalog).await.context("catalog unavailable")?;
    let broker = catalog.broker().clone();

    // the bus handler only enqueues, the event loop never waits on a decision
    let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(SNAPSHOT_QUEUE);
    let forward: Arc<dyn MessageHandler> = Arc::new(move |topic: &str, payload: &[u8]| {
        if tx.try_send((topic.to_string(), payload.to_vec())).is_err() {
            warn!(topic, "snapshot queue full, dropping");
        }
    });

    let options = BusOptions::new("greenbox-controller", broker.broker_ip, broker.broker_port);
    let bus = Arc::new(BusClient::start(options, Some(forward)));
    bus.subscribe(topics::STATISTICS_STATE_FILTER)
        .await
        .context("subscription to statistics failed")?;

    let weights = Weights {
        energy: config.energy_weight,
        water: config.water_weight,
    };
    let controller = Controller::from_catalog(&catalog, bus.clone(), weights, config.horizon_cap_s);
    info!(greenhouses = catalog.topology().len(), "controller ready");

    let worker = tokio::spawn(async move {
        while let Some((topic, payload)) = rx.recv().await {
            controller.on_message(&topic, &payload);
        }
    });

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    info!("shutdown requested");
    bus.stop(SHUTDOWN_TIMEOUT).await;
    worker.abort();

    let health = bus.health().report(bus.client_id());
    info!(reconnects = health.reconnects, uptime_s = health.uptime_seconds, "controller stopped");
    Ok(())
}
