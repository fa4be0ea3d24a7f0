//! Actuator connector: one bus client and one command task per actuator.
//!
//! The bus callback only queues payloads; the command task owns the
//! `Actuator` so commands of one actuator are applied in arrival order.

use crate::actuator::{Actuator, PowerState};
use greenbox_kernel::bus::{BusClient, BusError, BusOptions, MessageHandler, Publisher};
use greenbox_kernel::catalog::{ActuatorDevice, BrokerEndpoint};
use greenbox_kernel::effects::EffectsTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const COMMAND_QUEUE: usize = 32;

#[derive(Debug)]
pub enum ConnectorMsg {
    Payload(Vec<u8>),
    Shutdown,
}

/// Bus handler pushing every payload to the command task.
pub fn command_forwarder(device_id: String, tx: mpsc::Sender<ConnectorMsg>) -> Arc<dyn MessageHandler> {
    Arc::new(move |topic: &str, payload: &[u8]| {
        if tx.try_send(ConnectorMsg::Payload(payload.to_vec())).is_err() {
            warn!(actuator = %device_id, topic, "command queue full, dropping");
        }
    })
}

/// Applies queued commands until `Shutdown` (or the queue closes), then turns the actuator off.
pub async fn run_commands(mut actuator: Actuator, mut rx: mpsc::Receiver<ConnectorMsg>) -> PowerState {
    while let Some(msg) = rx.recv().await {
        match msg {
            ConnectorMsg::Payload(payload) => {
                actuator.handle_payload(&payload).await;
            }
            ConnectorMsg::Shutdown => break,
        }
    }
    actuator.turn_off().await;
    actuator.state()
}

struct RunningActuator {
    device_id: String,
    bus: Arc<BusClient>,
    commands: mpsc::Sender<ConnectorMsg>,
    task: JoinHandle<PowerState>,
}

pub struct ActuatorConnector {
    actuators: Vec<RunningActuator>,
}

impl ActuatorConnector {
    /// Starts every device with its greenhouse effects; `effects_for` returns `None` for unknown greenhouses.
    pub async fn start<'a, F>(
        devices: Vec<ActuatorDevice>,
        broker: &BrokerEndpoint,
        period: Duration,
        effects_for: F,
    ) -> Result<Self, BusError>
    where
        F: Fn(&ActuatorDevice) -> Option<&'a EffectsTable>,
    {
        let mut connector = Self {
            actuators: Vec::with_capacity(devices.len()),
        };

        for device in devices {
            let effects = effects_for(&device).cloned().unwrap_or_else(|| {
                warn!(
                    actuator = %device.device_id,
                    greenhouse = %device.zone.greenhouse_id,
                    "no effects table, effects will be neutral"
                );
                EffectsTable::default()
            });
            let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
            let handler = command_forwarder(device.device_id.clone(), tx.clone());
            let options = BusOptions::new(device.device_id.clone(), broker.broker_ip.clone(), broker.broker_port);
            let bus = Arc::new(BusClient::start(options, Some(handler)));

            let publisher: Arc<dyn Publisher> = bus.clone();
            let device_id = device.device_id.clone();
            let actuator = Actuator::new(device, effects, publisher, period);
            let cmd_topic = actuator.cmd_topic();
            let task = tokio::spawn(run_commands(actuator, rx));

            let running = RunningActuator {
                device_id,
                bus,
                commands: tx,
                task,
            };
            if let Err(e) = running.bus.subscribe(&cmd_topic).await {
                connector.actuators.push(running);
                connector.stop(Duration::from_secs(2)).await;
                return Err(e);
            }
            info!(actuator = %running.device_id, topic = %cmd_topic, "listening for commands");
            connector.actuators.push(running);
        }
        Ok(connector)
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    /// Turns every actuator OFF, then unsubscribes and disconnects its bus client.
    pub async fn stop(&mut self, timeout: Duration) {
        for running in self.actuators.drain(..) {
            let mut task = running.task;
            let stopped = tokio::time::timeout(timeout, async {
                let _ = running.commands.send(ConnectorMsg::Shutdown).await;
                (&mut task).await
            })
            .await;
            match stopped {
                Ok(Ok(state)) => {
                    info!(actuator = %running.device_id, on = state.on, level = state.level, "actuator off")
                }
                Ok(Err(e)) => warn!(actuator = %running.device_id, error = %e, "command task failed"),
                Err(_) => {
                    task.abort();
                    warn!(actuator = %running.device_id, "command task did not stop in time, aborted");
                }
            }
            running.bus.stop(timeout).await;
            let health = running.bus.health().report(running.bus.client_id());
            info!(
                actuator = %running.device_id,
                reconnects = health.reconnects,
                uptime_s = health.uptime_seconds,
                "actuator disconnected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbox_devkit::{effects_table, GreenboxMessageBuilder, MockBus};
    use greenbox_kernel::models::Zone;
    use serde_json::json;

    fn actuator(bus: &MockBus) -> Actuator {
        let effects = effects_table(&[("heating_system", 100, &[("temperature", 0.05)])]).unwrap();
        let device = ActuatorDevice {
            device_id: "heat-1".into(),
            system: "heating_system".into(),
            zone: Zone::new("gh1", "rb1"),
        };
        Actuator::new(device, effects, Arc::new(bus.clone()), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn bus_commands_flow_in_order_and_shutdown_turns_off() {
        let bus = MockBus::new();
        let actuator = actuator(&bus);
        let cmd_topic = actuator.cmd_topic();
        assert_eq!(cmd_topic, "/gh1/rb1/actuators/heating_system/cmd");

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        bus.subscribe(&cmd_topic, command_forwarder("heat-1".into(), tx.clone()));
        let task = tokio::spawn(run_commands(actuator, rx));

        bus.simulate_json(&cmd_topic, &GreenboxMessageBuilder::command("ON", json!(100)));
        bus.simulate_incoming(&cmd_topic, b"garbage");
        bus.simulate_json("/gh1/rb1/actuators/cooling_system/cmd", &GreenboxMessageBuilder::command("OFF", json!(0)));
        tokio::time::sleep(Duration::from_secs(6)).await;

        let data = bus.find_messages_by_topic("/gh1/rb1/actuators/heating_system/heat-1/data");
        assert_eq!(data.len(), 2);
        assert_eq!(data[1].json().unwrap()["delta_temperature"], 0.25);

        tx.send(ConnectorMsg::Shutdown).await.unwrap();
        let state = task.await.unwrap();
        assert!(!state.on);
        assert_eq!(state.level, 0);
    }
}
