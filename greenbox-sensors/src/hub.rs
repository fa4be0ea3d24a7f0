//! Sensor hub: one worker and one bus client per sensor device.

use crate::deltas::DeltaInjector;
use crate::reader::SensorReader;
use crate::sensor::SensorWorker;
use greenbox_kernel::bus::{BusClient, BusError, BusOptions, MessageHandler};
use greenbox_kernel::catalog::{BrokerEndpoint, SensorDevice};
use greenbox_kernel::topics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct RunningSensor {
    device_id: String,
    bus: Arc<BusClient>,
    handle: JoinHandle<()>,
}

pub struct SensorHub {
    sensors: Vec<RunningSensor>,
    shutdown: watch::Sender<bool>,
}

impl SensorHub {
    /// Starts every sensor; `make_reader` supplies the value source of each device.
    pub async fn start<F>(
        devices: Vec<SensorDevice>,
        broker: &BrokerEndpoint,
        period: Duration,
        mut make_reader: F,
    ) -> Result<Self, BusError>
    where
        F: FnMut(&SensorDevice) -> Box<dyn SensorReader>,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut hub = Self {
            sensors: Vec::with_capacity(devices.len()),
            shutdown,
        };

        for device in devices {
            let deltas = Arc::new(DeltaInjector::new());
            let handler: Arc<dyn MessageHandler> = deltas.clone();
            let options = BusOptions::new(device.device_id.clone(), broker.broker_ip.clone(), broker.broker_port);
            let bus = Arc::new(BusClient::start(options, Some(handler)));

            if let Err(e) = bus.subscribe(&topics::actuator_data_filter(&device.zone)).await {
                // already started sensors must not leak
                hub.stop(Duration::from_secs(2)).await;
                bus.stop(Duration::from_secs(2)).await;
                return Err(e);
            }

            let worker = SensorWorker::new(
                device.device_id.clone(),
                device.zone.clone(),
                device.measurements.clone(),
                make_reader(&device),
                deltas,
                bus.clone(),
            );
            let handle = tokio::spawn(worker.run(period, shutdown_rx.clone()));
            hub.sensors.push(RunningSensor {
                device_id: device.device_id,
                bus,
                handle,
            });
        }

        info!(sensors = hub.sensors.len(), "sensor hub started");
        Ok(hub)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Stops every worker, then its bus client; each join is bounded by `timeout`.
    pub async fn stop(&mut self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        for sensor in self.sensors.drain(..) {
            let mut handle = sensor.handle;
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                handle.abort();
                warn!(sensor = %sensor.device_id, "sensor loop did not stop in time, aborted");
            }
            sensor.bus.stop(timeout).await;
            let health = sensor.bus.health().report(sensor.bus.client_id());
            info!(sensor = %sensor.device_id, reconnects = health.reconnects, "sensor stopped");
        }
    }
}
