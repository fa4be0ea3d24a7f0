//! One sensor device: reads every measurement at a fixed period, adds the
//! actuator deltas of its zone and publishes each reading.

use crate::deltas::DeltaInjector;
use crate::reader::SensorReader;
use greenbox_kernel::bus::{publish_json, Publisher};
use greenbox_kernel::catalog::MeasurementRecord;
use greenbox_kernel::models::{SensorReading, Zone};
use greenbox_kernel::topics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outbound readings carry three decimals.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub struct SensorWorker {
    device_id: String,
    zone: Zone,
    measurements: Vec<MeasurementRecord>,
    reader: Box<dyn SensorReader>,
    deltas: Arc<DeltaInjector>,
    bus: Arc<dyn Publisher>,
}

impl SensorWorker {
    pub fn new(
        device_id: impl Into<String>,
        zone: Zone,
        measurements: Vec<MeasurementRecord>,
        reader: Box<dyn SensorReader>,
        deltas: Arc<DeltaInjector>,
        bus: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            zone,
            measurements,
            reader,
            deltas,
            bus,
        }
    }

    pub fn reading(&mut self, measurement: &MeasurementRecord) -> Option<SensorReading> {
        let metric = &measurement.metric;
        let base = match self.reader.read(metric) {
            Ok(v) => v,
            Err(e) => {
                warn!(sensor = %self.device_id, metric = %metric, error = %e, "read failed");
                return None;
            }
        };
        let contribution = self.deltas.contribution(metric);
        if !contribution.contributors.is_empty() {
            debug!(
                sensor = %self.device_id,
                metric = %metric,
                base,
                delta = contribution.total,
                contributors = ?contribution.contributors,
                "actuator effects applied"
            );
        }
        Some(SensorReading {
            value: round3(base + contribution.total),
            unit: measurement.unit.clone(),
            sensor: self.device_id.clone(),
            metric: metric.clone(),
            site: self.zone.greenhouse_id.clone(),
            device: self.zone.raspberry_id.clone(),
        })
    }

    /// One read pass; returns the number of readings published.
    pub fn read_and_publish(&mut self) -> usize {
        let measurements = self.measurements.clone();
        let mut published = 0;
        for measurement in &measurements {
            let Some(reading) = self.reading(measurement) else {
                continue;
            };
            let topic = topics::sensor_reading(&self.zone, &self.device_id, &reading.metric);
            if publish_json(self.bus.as_ref(), &topic, &reading) {
                published += 1;
            }
        }
        published
    }

    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            sensor = %self.device_id,
            zone = %self.zone,
            metrics = self.measurements.len(),
            period_s = period.as_secs_f64(),
            "sensor loop started"
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.read_and_publish();
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(sensor = %self.device_id, "sensor loop stopped");
    }
}
