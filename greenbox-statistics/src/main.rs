//! Greenbox Statistics - zone state aggregator
//!
//! Every STATS_AGGREGATION_INTERVAL_S seconds, reads the sliding window of
//! samples of each zone from the time-series store and publishes a snapshot
//! of medians on `/<gh>/<rb>/statistics/state`. A failing query only drops
//! its metric; zones without data publish nothing.

mod aggregator;

use crate::aggregator::{plan_zones, StateAggregator};
use anyhow::{Context, Result};
use greenbox_kernel::bus::{BusClient, BusOptions};
use greenbox_kernel::catalog::load_catalog;
use greenbox_kernel::config::GreenboxConfig;
use greenbox_kernel::logging;
use greenbox_kernel::tsdb::{InfluxReader, InfluxSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = GreenboxConfig::from_env().context("invalid configuration")?;
    logging::init_tracing("greenbox-statistics");

    let catalog = load_catalog(&config.catalog).await.context("catalog unavailable")?;
    let broker = catalog.broker().clone();
    let zones = plan_zones(&catalog.topology());

    let settings = InfluxSettings::from_env().context("time-series database not configured")?;
    info!(url = %settings.url, database = %settings.database, "time-series store configured");
    let store = Arc::new(InfluxReader::new(settings).context("cannot build tsdb client")?);

    // publication seule : pas de handler
    let options = BusOptions::new("greenbox-statistics", broker.broker_ip, broker.broker_port);
    let bus = Arc::new(BusClient::start(options, None));

    let aggregator = StateAggregator::new(
        store,
        bus.clone(),
        zones,
        config.stats_window,
        config.aggregation_interval,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(async move { aggregator.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, worker).await.is_err() {
        tracing::warn!("aggregation loop did not stop in time");
    }
    bus.stop(SHUTDOWN_TIMEOUT).await;

    let health = bus.health().report(bus.client_id());
    info!(reconnects = health.reconnects, uptime_s = health.uptime_seconds, "statistics stopped");
    Ok(())
}
