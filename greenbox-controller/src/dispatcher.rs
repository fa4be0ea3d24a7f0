//! Snapshot dispatcher: routes each zone snapshot through that zone's
//! optimizers and publishes the resulting commands and alerts.
//!
//! Zone optimizers are built on the first snapshot of a zone and cached;
//! the zone's lock is held from decision to publication.

use crate::light::LightOptimizer;
use crate::optimizer::{DecisionMode, MainOptimizer, Weights};
use crate::ph::PhMonitor;
use greenbox_kernel::bus::{publish_json, MessageHandler, Publisher};
use greenbox_kernel::catalog::Catalog;
use greenbox_kernel::effects::{EffectsTable, ILLUMINATION_SYSTEM};
use greenbox_kernel::models::{ActionMap, ActuatorCommand, PhAlert, Zone, ZoneSnapshot};
use greenbox_kernel::state::ZoneCache;
use greenbox_kernel::threshold::ThresholdMap;
use greenbox_kernel::topics;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no configuration for greenhouse '{0}'")]
    UnknownGreenhouse(String),
}

pub struct ZoneOptimizers {
    main: MainOptimizer,
    light: Option<LightOptimizer>,
    ph: Option<PhMonitor>,
    last_actions: ActionMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub mode: DecisionMode,
    pub commands: usize,
    pub light: Option<ActuatorCommand>,
    pub alert: Option<PhAlert>,
}

struct GreenhouseSettings {
    thresholds: ThresholdMap,
    effects: EffectsTable,
}

pub struct Controller {
    bus: Arc<dyn Publisher>,
    greenhouses: HashMap<String, GreenhouseSettings>,
    weights: Weights,
    horizon_cap_s: Option<f64>,
    zones: ZoneCache<ZoneOptimizers>,
}

impl Controller {
    pub fn new(bus: Arc<dyn Publisher>, weights: Weights, horizon_cap_s: Option<f64>) -> Self {
        Self {
            bus,
            greenhouses: HashMap::new(),
            weights,
            horizon_cap_s,
            zones: ZoneCache::new(),
        }
    }

    pub fn from_catalog(
        catalog: &Catalog,
        bus: Arc<dyn Publisher>,
        weights: Weights,
        horizon_cap_s: Option<f64>,
    ) -> Self {
        let mut controller = Self::new(bus, weights, horizon_cap_s);
        for topology in catalog.topology() {
            let gh = topology.greenhouse_id;
            if let (Some(thresholds), Some(effects)) = (catalog.thresholds(&gh), catalog.effects(&gh)) {
                controller.add_greenhouse(&gh, thresholds.clone(), effects.clone());
            }
        }
        controller
    }

    pub fn add_greenhouse(&mut self, greenhouse_id: &str, thresholds: ThresholdMap, effects: EffectsTable) {
        self.greenhouses
            .insert(greenhouse_id.to_string(), GreenhouseSettings { thresholds, effects });
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn handle_payload(&self, payload: &[u8]) -> Result<DispatchOutcome, DispatchError> {
        let snapshot: ZoneSnapshot = serde_json::from_slice(payload)?;
        self.handle_snapshot(&snapshot)
    }

    pub fn handle_snapshot(&self, snapshot: &ZoneSnapshot) -> Result<DispatchOutcome, DispatchError> {
        let zone = snapshot.zone();
        let entry = self.zones.get_or_try_insert_with(&zone, || self.build_zone(&zone))?;
        let mut guard = entry.lock();
        let optimizers = &mut *guard;
        let medians = snapshot.medians();

        let decision = optimizers.main.decide(&medians, &optimizers.last_actions);
        let mut outcome = DispatchOutcome {
            mode: decision.mode,
            commands: 0,
            light: None,
            alert: None,
        };

        if decision.mode != DecisionMode::Hold && decision.actions != optimizers.last_actions {
            for (system, level) in &decision.actions {
                if system == ILLUMINATION_SYSTEM {
                    continue;
                }
                let topic = topics::actuator_cmd(&zone, system);
                if publish_json(self.bus.as_ref(), &topic, &ActuatorCommand::for_level(*level)) {
                    outcome.commands += 1;
                }
            }
            info!(
                zone = %zone,
                actions = ?decision.actions,
                time_to_band_s = ?decision.time_to_band_s,
                violation = decision.violation,
                "actuator plan updated"
            );
            optimizers.last_actions = decision.actions;
        } else {
            debug!(zone = %zone, mode = ?decision.mode, "actuator plan unchanged");
        }

        if let (Some(median), Some(light)) = (medians.get("light"), optimizers.light.as_mut()) {
            if let Some(cmd) = light.decide(*median) {
                let topic = topics::actuator_cmd(&zone, ILLUMINATION_SYSTEM);
                publish_json(self.bus.as_ref(), &topic, &cmd);
                info!(zone = %zone, cmd = %cmd.cmd, level = cmd.level, median, "illumination changed");
                outcome.light = Some(cmd);
            }
        }

        if let (Some(median), Some(ph)) = (medians.get("pH"), optimizers.ph.as_mut()) {
            if let Some(alert) = ph.observe(*median) {
                publish_json(self.bus.as_ref(), &topics::ph_alert(&zone), &alert);
                warn!(zone = %zone, alert = %alert.message, "pH alert");
                outcome.alert = Some(alert);
            }
        }

        Ok(outcome)
    }

    fn build_zone(&self, zone: &Zone) -> Result<ZoneOptimizers, DispatchError> {
        let settings = self
            .greenhouses
            .get(&zone.greenhouse_id)
            .ok_or_else(|| DispatchError::UnknownGreenhouse(zone.greenhouse_id.clone()))?;

        let main = MainOptimizer::new(&settings.thresholds, &settings.effects, self.weights, self.horizon_cap_s);
        let light = settings
            .thresholds
            .get("light")
            .and_then(|t| LightOptimizer::new(t, &settings.effects));
        let ph = settings.thresholds.get("pH").map(PhMonitor::new);
        info!(
            zone = %zone,
            systems = main.systems().count(),
            light = light.is_some(),
            ph = ph.is_some(),
            "zone optimizers created"
        );

        Ok(ZoneOptimizers {
            main,
            light,
            ph,
            last_actions: ActionMap::new(),
        })
    }
}

impl MessageHandler for Controller {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.handle_payload(payload) {
            warn!(topic, error = %e, "snapshot dropped");
        }
    }
}
