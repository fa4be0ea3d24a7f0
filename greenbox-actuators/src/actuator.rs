//! Actuator state machine and effect publisher.
//!
//! `OFF --ON(l)--> ON(l)`, `ON(l) --ON(l')--> ON(l')` with the epoch reset,
//! `ON --OFF--> OFF`. While on, a publisher task emits the effect message of
//! the current level every period. `(on, level, on_epoch)` live under one
//! mutex shared by the command path and the publisher.

use greenbox_kernel::bus::{publish_json, Publisher};
use greenbox_kernel::catalog::ActuatorDevice;
use greenbox_kernel::effects::EffectsTable;
use greenbox_kernel::models::ActuatorEffectMessage;
use greenbox_kernel::state::{new_state, Shared};
use greenbox_kernel::topics;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const MAX_LEVEL: u8 = 100;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("command is not a JSON object")]
    NotAnObject,
    #[error("missing 'cmd'")]
    MissingCmd,
    #[error("unsupported cmd '{0}'")]
    UnsupportedCmd(String),
    #[error("invalid level {0}")]
    InvalidLevel(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    On(Option<u8>),
    Off,
}

/// `{cmd, level?}`; `cmd` is case-insensitive.
pub fn parse_command(payload: &[u8]) -> Result<Command, CommandError> {
    let Value::Object(obj) = serde_json::from_slice::<Value>(payload)? else {
        return Err(CommandError::NotAnObject);
    };
    let cmd = match obj.get("cmd") {
        None | Some(Value::Null) => return Err(CommandError::MissingCmd),
        Some(Value::String(s)) => s.trim().to_uppercase(),
        Some(other) => return Err(CommandError::UnsupportedCmd(other.to_string())),
    };
    match cmd.as_str() {
        "ON" => Ok(Command::On(obj.get("level").map(coerce_level).transpose()?.flatten())),
        "OFF" => Ok(Command::Off),
        _ => Err(CommandError::UnsupportedCmd(cmd)),
    }
}

/// Integer, float (truncated) or numeric string within `0..=100`; `null` means absent.
fn coerce_level(raw: &Value) -> Result<Option<u8>, CommandError> {
    let number = match raw {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let invalid = || CommandError::InvalidLevel(raw.clone());
    let truncated = number.filter(|n| n.is_finite()).ok_or_else(invalid)?.trunc();
    if !(0.0..=f64::from(MAX_LEVEL)).contains(&truncated) {
        return Err(invalid());
    }
    Ok(Some(truncated as u8))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    TurnedOn,
    LevelChanged,
    AlreadyOn,
    TurnedOff,
    AlreadyOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerState {
    pub on: bool,
    pub level: u8,
    pub on_epoch: Option<Instant>,
}

struct ActuatorCore {
    device: ActuatorDevice,
    effects: EffectsTable,
    state: Shared<PowerState>,
    bus: Arc<dyn Publisher>,
    data_topic: String,
}

impl ActuatorCore {
    fn effect_message(&self, now: Instant) -> Option<ActuatorEffectMessage> {
        let state = *self.state.lock();
        let epoch = state.on_epoch.filter(|_| state.on)?;
        let elapsed = now.saturating_duration_since(epoch).as_secs();
        let row = self.effects.row_or_neutral(&self.device.system, state.level);

        let deltas: BTreeMap<String, f64> = row
            .effects
            .iter()
            .map(|(metric, effect)| (format!("delta_{metric}"), effect.delta_after(elapsed as f64)))
            .collect();

        Some(ActuatorEffectMessage {
            id: self.device.device_id.clone(),
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            seconds_since_on: elapsed,
            system: self.device.system.clone(),
            level: state.level,
            deltas,
            energy_consumption: row.energy_consumption,
            water_consumption: row.water_consumption,
        })
    }

    fn publish_effects(&self) -> bool {
        match self.effect_message(Instant::now()) {
            Some(message) => publish_json(self.bus.as_ref(), &self.data_topic, &message),
            None => false,
        }
    }
}

struct EffectPublisher {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EffectPublisher {
    fn spawn(core: Arc<ActuatorCore>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        core.publish_effects();
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
        Self { stop_tx, handle }
    }

    /// Waits at most two periods, then aborts.
    async fn stop(self, period: Duration, device_id: &str) {
        let _ = self.stop_tx.send(true);
        let mut handle = self.handle;
        if tokio::time::timeout(period * 2, &mut handle).await.is_err() {
            handle.abort();
            warn!(actuator = device_id, "effect publisher did not stop in time, aborted");
        }
    }
}

pub struct Actuator {
    core: Arc<ActuatorCore>,
    publisher: Option<EffectPublisher>,
    period: Duration,
}

impl Actuator {
    pub fn new(device: ActuatorDevice, effects: EffectsTable, bus: Arc<dyn Publisher>, period: Duration) -> Self {
        let data_topic = topics::actuator_data(&device.zone, &device.system, &device.device_id);
        let core = ActuatorCore {
            device,
            effects,
            state: new_state(PowerState {
                on: false,
                level: 0,
                on_epoch: None,
            }),
            bus,
            data_topic,
        };
        Self {
            core: Arc::new(core),
            publisher: None,
            period,
        }
    }

    pub fn state(&self) -> PowerState {
        *self.core.state.lock()
    }

    pub fn cmd_topic(&self) -> String {
        topics::actuator_cmd(&self.core.device.zone, &self.core.device.system)
    }

    /// Parses and applies a bus command; bad payloads are logged and leave the state untouched.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> Option<Transition> {
        match parse_command(payload) {
            Ok(command) => Some(self.apply(command).await),
            Err(e) => {
                warn!(actuator = %self.core.device.device_id, error = %e, "command ignored");
                None
            }
        }
    }

    pub async fn apply(&mut self, command: Command) -> Transition {
        match command {
            Command::On(level) => self.turn_on(level),
            Command::Off => self.turn_off().await,
        }
    }

    pub fn turn_on(&mut self, level: Option<u8>) -> Transition {
        let id = &self.core.device.device_id;
        let transition = {
            let mut state = self.core.state.lock();
            match (state.on, level) {
                (true, Some(l)) if l != state.level => {
                    state.level = l;
                    state.on_epoch = Some(Instant::now());
                    Transition::LevelChanged
                }
                (true, _) => Transition::AlreadyOn,
                (false, _) => {
                    if let Some(l) = level {
                        state.level = l;
                    }
                    state.on = true;
                    state.on_epoch = Some(Instant::now());
                    Transition::TurnedOn
                }
            }
        };

        match transition {
            Transition::TurnedOn => {
                self.publisher = Some(EffectPublisher::spawn(self.core.clone(), self.period));
                info!(actuator = %id, level = self.state().level, "state: ON");
            }
            Transition::LevelChanged => info!(actuator = %id, level = self.state().level, "level changed"),
            _ => debug!(actuator = %id, "already ON"),
        }
        transition
    }

    pub async fn turn_off(&mut self) -> Transition {
        let was_on = {
            let mut state = self.core.state.lock();
            let was_on = state.on;
            state.on = false;
            state.level = 0;
            state.on_epoch = None;
            was_on
        };
        if let Some(publisher) = self.publisher.take() {
            publisher.stop(self.period, &self.core.device.device_id).await;
        }
        if was_on {
            info!(actuator = %self.core.device.device_id, "state: OFF, publishing stopped");
            Transition::TurnedOff
        } else {
            debug!(actuator = %self.core.device.device_id, "already OFF");
            Transition::AlreadyOff
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbox_devkit::{effects_table, MockBus, TestHarness};
    use greenbox_kernel::models::Zone;
    use serde_json::json;

    const DATA: &str = "/gh1/rb1/actuators/ventilation_system/fan-1/data";

    fn fan(bus: &MockBus) -> Actuator {
        let effects = effects_table(&[
            (
                "ventilation_system",
                50,
                &[("temperature", -0.01), ("humidity", -0.05), ("energy_consumption", 0.1)],
            ),
            (
                "ventilation_system",
                100,
                &[("temperature", -0.02), ("light", 0.0), ("energy_consumption", 0.2)],
            ),
        ])
        .unwrap();
        let device = ActuatorDevice {
            device_id: "fan-1".into(),
            system: "ventilation_system".into(),
            zone: Zone::new("gh1", "rb1"),
        };
        Actuator::new(device, effects, Arc::new(bus.clone()), Duration::from_secs(5))
    }

    #[test]
    fn parses_and_coerces_commands() {
        assert_eq!(parse_command(br#"{"cmd":"on","level":50}"#).unwrap(), Command::On(Some(50)));
        assert_eq!(parse_command(br#"{"cmd":"ON","level":75.9}"#).unwrap(), Command::On(Some(75)));
        assert_eq!(parse_command(br#"{"cmd":"ON","level":"30"}"#).unwrap(), Command::On(Some(30)));
        assert_eq!(parse_command(br#"{"cmd":"ON"}"#).unwrap(), Command::On(None));
        assert_eq!(parse_command(br#"{"cmd":"Off","level":80}"#).unwrap(), Command::Off);

        assert!(matches!(parse_command(b"not json"), Err(CommandError::Json(_))));
        assert!(matches!(parse_command(b"[]"), Err(CommandError::NotAnObject)));
        assert!(matches!(parse_command(br#"{"level":5}"#), Err(CommandError::MissingCmd)));
        assert!(matches!(parse_command(br#"{"cmd":"TOGGLE"}"#), Err(CommandError::UnsupportedCmd(_))));
        assert!(matches!(
            parse_command(br#"{"cmd":"ON","level":"high"}"#),
            Err(CommandError::InvalidLevel(_))
        ));
        assert!(matches!(
            parse_command(br#"{"cmd":"ON","level":150}"#),
            Err(CommandError::InvalidLevel(_))
        ));
        assert!(matches!(
            parse_command(br#"{"cmd":"ON","level":-1}"#),
            Err(CommandError::InvalidLevel(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_cumulative_effects_while_on() {
        let bus = MockBus::new();
        let mut fan = fan(&bus);
        assert_eq!(fan.turn_on(Some(50)), Transition::TurnedOn);

        tokio::time::sleep(Duration::from_secs(11)).await;
        // ticks at 0s, 5s and 10s
        let messages = bus.find_messages_by_topic(DATA);
        assert_eq!(messages.len(), 3);
        let last = messages[2].json().unwrap();
        assert_eq!(last["seconds_since_on"], 10);
        assert_eq!(last["level"], 50);
        assert_eq!(last["delta_temperature"], -0.1);
        assert_eq!(last["delta_humidity"], -0.5);
        assert_eq!(last["energy_consumption"], 0.1);
        assert_eq!(last["water_consumption"], 0.0);
        assert_eq!(last["id"], "fan-1");

        assert_eq!(fan.turn_off().await, Transition::TurnedOff);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(bus.find_messages_by_topic(DATA).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn light_delta_is_instantaneous() {
        let bus = MockBus::new();
        let mut fan = fan(&bus);
        fan.turn_on(Some(100));
        tokio::time::sleep(Duration::from_secs(6)).await;
        let last = bus.last_json(DATA).unwrap();
        assert_eq!(last["seconds_since_on"], 5);
        assert_eq!(last["delta_light"], 0.0);
        assert_eq!(last["delta_temperature"], -0.1);
        fan.turn_off().await;
    }

    #[tokio::test(start_paused = true)]
    async fn level_change_resets_epoch_but_same_level_does_not() {
        let bus = MockBus::new();
        let mut fan = fan(&bus);
        fan.turn_on(Some(50));
        let first = fan.state().on_epoch;

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(fan.turn_on(Some(50)), Transition::AlreadyOn);
        assert_eq!(fan.state().on_epoch, first);
        assert_eq!(fan.turn_on(None), Transition::AlreadyOn);

        assert_eq!(fan.turn_on(Some(100)), Transition::LevelChanged);
        assert_ne!(fan.state().on_epoch, first);
        assert_eq!(fan.state().level, 100);
        fan.turn_off().await;
    }

    #[tokio::test(start_paused = true)]
    async fn off_always_forces_level_zero() {
        let bus = MockBus::new();
        let mut fan = fan(&bus);
        assert_eq!(fan.turn_off().await, Transition::AlreadyOff);
        assert_eq!(
            fan.state(),
            PowerState {
                on: false,
                level: 0,
                on_epoch: None
            }
        );

        fan.turn_on(Some(100));
        fan.turn_off().await;
        assert_eq!(fan.turn_off().await, Transition::AlreadyOff);
        assert!(!fan.state().on);
        assert_eq!(fan.state().level, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_commands_leave_state_untouched() {
        let bus = MockBus::new();
        let mut fan = fan(&bus);
        fan.turn_on(Some(50));
        let before = fan.state();

        assert_eq!(fan.handle_payload(b"{oops").await, None);
        assert_eq!(fan.handle_payload(br#"{"cmd":"ON","level":"x"}"#).await, None);
        assert_eq!(fan.handle_payload(br#"{"cmd":"DIM"}"#).await, None);
        assert_eq!(fan.state(), before);

        assert_eq!(fan.handle_payload(br#"{"cmd":"OFF"}"#).await, Some(Transition::TurnedOff));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_level_publishes_neutral_effects() {
        let harness = TestHarness::new();
        let mut fan = fan(&harness.bus);
        fan.turn_on(Some(30));

        let msg = harness.wait_for_message(DATA, Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg["level"], 30);
        assert_eq!(msg["energy_consumption"], 0.0);
        assert!(msg.get("delta_temperature").is_none());
        harness.assert_field_equals(DATA, "system", &json!("ventilation_system")).unwrap();
        fan.turn_off().await;
    }
}
