//! Zone state aggregator
//!
//! Every tick, for each zone and each metric measured in its greenhouse, reads
//! the samples of the last window from the store and publishes one snapshot
//! of medians per zone. Zones without a single sample are skipped.

use greenbox_kernel::bus::{publish_json, Publisher};
use greenbox_kernel::catalog::GreenhouseTopology;
use greenbox_kernel::models::{MetricStats, Zone, ZoneSnapshot};
use greenbox_kernel::topics;
use greenbox_kernel::tsdb::{SampleQuery, SampleStore, MAX_LIMIT};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ZonePlan {
    pub zone: Zone,
    pub metrics: Vec<String>,
}

/// One plan per (greenhouse, raspberry) with the greenhouse's measured metrics.
pub fn plan_zones(topology: &[GreenhouseTopology]) -> Vec<ZonePlan> {
    topology
        .iter()
        .flat_map(|gh| {
            gh.raspberries.iter().map(move |rb| ZonePlan {
                zone: Zone::new(gh.greenhouse_id.clone(), rb.clone()),
                metrics: gh.measurements.clone(),
            })
        })
        .collect()
}

/// Median of an ascending slice; even lengths average the two middle values.
pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    if n % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn summarize(mut values: Vec<f64>) -> Option<MetricStats> {
    values.retain(|v| v.is_finite());
    values.sort_by(f64::total_cmp);
    let median = median(&values)?;
    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;
    let std_dev = if n > 1 {
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };
    Some(MetricStats {
        median,
        mean: Some(mean),
        min: values.first().copied(),
        max: values.last().copied(),
        std_dev: Some(std_dev),
        count: Some(n),
    })
}

pub struct StateAggregator {
    store: Arc<dyn SampleStore>,
    bus: Arc<dyn Publisher>,
    zones: Vec<ZonePlan>,
    window: Duration,
    interval: Duration,
}

impl StateAggregator {
    pub fn new(
        store: Arc<dyn SampleStore>,
        bus: Arc<dyn Publisher>,
        zones: Vec<ZonePlan>,
        window: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            zones,
            window,
            interval,
        }
    }

    /// Snapshot of `plan` over `[now - window, now]`; `None` when no metric had samples.
    pub async fn snapshot(&self, plan: &ZonePlan, now: OffsetDateTime) -> Option<ZoneSnapshot> {
        let start = now - self.window;
        let mut metrics = BTreeMap::new();

        for metric in &plan.metrics {
            let query = SampleQuery::new(metric)
                .between(start, now)
                .site(&plan.zone.greenhouse_id)
                .device(&plan.zone.raspberry_id)
                .limit(MAX_LIMIT)
                .ascending();
            match self.store.read(&query).await {
                Ok(samples) => {
                    let values = samples.into_iter().map(|s| s.value).collect();
                    if let Some(stats) = summarize(values) {
                        metrics.insert(metric.clone(), stats);
                    }
                }
                Err(e) => warn!(zone = %plan.zone, metric = %metric, error = %e, "tsdb query failed, metric skipped"),
            }
        }

        if metrics.is_empty() {
            return None;
        }
        Some(ZoneSnapshot {
            timestamp_utc: now.format(&Rfc3339).unwrap_or_default(),
            greenhouse_id: plan.zone.greenhouse_id.clone(),
            raspberry_id: plan.zone.raspberry_id.clone(),
            metrics,
        })
    }

    /// One aggregation pass over every zone; returns the number of snapshots published.
    pub async fn tick(&self, now: OffsetDateTime) -> usize {
        let mut published = 0;
        for plan in &self.zones {
            let Some(snapshot) = self.snapshot(plan, now).await else {
                debug!(zone = %plan.zone, "no samples in window, zone skipped");
                continue;
            };
            if publish_json(self.bus.as_ref(), &topics::statistics_state(&plan.zone), &snapshot) {
                published += 1;
            }
        }
        published
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            zones = self.zones.len(),
            interval_s = self.interval.as_secs_f64(),
            window_s = self.window.as_secs(),
            "starting aggregation loop"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = tokio::time::Instant::now();
                    let published = self.tick(OffsetDateTime::now_utc()).await;
                    debug!(published, elapsed_ms = started.elapsed().as_millis(), "aggregation tick complete");
                }
                _ = shutdown.changed() => {
                    info!("stopping aggregation loop");
                    break;
                }
            }
        }
    }
}
