use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Système -> niveau, la vue du contrôleur sur chaque actionneur.
pub type ActionMap = BTreeMap<String, u8>;

/// Métrique -> valeur courante.
pub type MetricValues = HashMap<String, f64>;

/// Zone de contrôle : un raspberry dans une serre.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Zone {
    pub greenhouse_id: String,
    pub raspberry_id: String,
}

impl Zone {
    pub fn new(greenhouse_id: impl Into<String>, raspberry_id: impl Into<String>) -> Self {
        Self {
            greenhouse_id: greenhouse_id.into(),
            raspberry_id: raspberry_id.into(),
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.greenhouse_id, self.raspberry_id)
    }
}

/// Résumé d'une métrique sur la fenêtre d'agrégation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub median: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl MetricStats {
    pub fn median_only(median: f64) -> Self {
        Self {
            median,
            mean: None,
            min: None,
            max: None,
            std_dev: None,
            count: None,
        }
    }
}

/// Publié sur `/<gh>/<rb>/statistics/state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub timestamp_utc: String,
    pub greenhouse_id: String,
    pub raspberry_id: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricStats>,
}

impl ZoneSnapshot {
    pub fn zone(&self) -> Zone {
        Zone::new(self.greenhouse_id.clone(), self.raspberry_id.clone())
    }

    pub fn median(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).map(|s| s.median)
    }

    /// Médianes indexées par nom canonique de métrique.
    pub fn medians(&self) -> MetricValues {
        self.metrics
            .iter()
            .map(|(metric, stats)| (crate::threshold::canonical_metric(metric), stats.median))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::On => f.write_str("ON"),
            CommandKind::Off => f.write_str("OFF"),
        }
    }
}

/// Publié sur `/<gh>/<rb>/actuators/<system>/cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub cmd: CommandKind,
    pub level: u8,
}

impl ActuatorCommand {
    /// Niveau 0 = OFF, tout autre niveau = ON à ce niveau.
    pub fn for_level(level: u8) -> Self {
        if level == 0 {
            Self { cmd: CommandKind::Off, level: 0 }
        } else {
            Self { cmd: CommandKind::On, level }
        }
    }
}

/// Publié par un actionneur sur `/<gh>/<rb>/actuators/<system>/<id>/data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorEffectMessage {
    pub id: String,
    pub timestamp: String,
    pub seconds_since_on: u64,
    pub system: String,
    pub level: u8,
    /// Entrées `delta_<metric>`.
    #[serde(flatten)]
    pub deltas: BTreeMap<String, f64>,
    pub energy_consumption: f64,
    pub water_consumption: f64,
}

/// Publié par un capteur sur `/<gh>/<rb>/sensors/<device>/<metric>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    pub unit: Option<String>,
    pub sensor: String,
    pub metric: String,
    pub site: String,
    pub device: String,
}

/// Publié sur `/<gh>/<rb>/alerts/ph`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhAlert {
    pub topic: String,
    pub message: String,
}

impl PhAlert {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            topic: "alerts/ph".to_string(),
            message: message.into(),
        }
    }
}
