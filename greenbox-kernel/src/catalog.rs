//! Client du catalogue : broker, topologie des serres, seuils et effets.
//!
//! Chaque démon charge le catalogue une seule fois au démarrage, depuis le
//! service HTTP ou depuis un document YAML/JSON local. Toute erreur ici est
//! fatale pour l'appelant.

use crate::config::CatalogSource;
use crate::effects::{EffectRecord, EffectsError, EffectsTable};
use crate::models::Zone;
use crate::threshold::{canonical_metric, is_known_metric, ThresholdError, ThresholdMap, ThresholdRow};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cannot read catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid catalog document: {0}")]
    Document(#[from] serde_yaml::Error),
    #[error("login response carries no token")]
    MissingToken,
    #[error("greenhouse {greenhouse}: {source}")]
    Threshold {
        greenhouse: String,
        #[source]
        source: ThresholdError,
    },
    #[error("greenhouse {greenhouse}: {source}")]
    Effects {
        greenhouse: String,
        #[source]
        source: EffectsError,
    },
    #[error("device {device} of greenhouse {greenhouse} has no raspberry")]
    UnassignedDevice { greenhouse: String, device: String },
    #[error("device {device} of greenhouse {greenhouse} measures unknown metric '{metric}'")]
    UnknownMeasurement {
        greenhouse: String,
        device: String,
        metric: String,
    },
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}

fn port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    let raw = string_or_number(deserializer)?;
    raw.trim().parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub broker_ip: String,
    #[serde(deserialize_with = "port")]
    pub broker_port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MeasurementRecord {
    #[serde(rename = "type")]
    pub metric: String,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Raspberry,
    Sensor,
    Actuator,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub raspberry_id: Option<String>,
    #[serde(default)]
    pub measurements: Vec<MeasurementRecord>,
}

impl DeviceRecord {
    pub fn role(&self) -> DeviceRole {
        if self.kind.eq_ignore_ascii_case("raspberry") {
            DeviceRole::Raspberry
        } else if !self.measurements.is_empty() || self.name.to_lowercase().contains("sensor") {
            DeviceRole::Sensor
        } else {
            DeviceRole::Actuator
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RaspberryRef {
    Id(String),
    Record {
        #[serde(deserialize_with = "string_or_number")]
        id: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreenhouseRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    raspberries: Vec<RaspberryRef>,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdRow>,
    #[serde(default)]
    pub effects: Vec<EffectRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogDocument {
    pub broker: BrokerEndpoint,
    #[serde(default)]
    pub greenhouses: Vec<GreenhouseRecord>,
}

#[derive(Debug, Deserialize)]
struct GreenhousesResponse {
    #[serde(default)]
    greenhouses: Vec<GreenhouseRecord>,
}

/// Configuration validée d'une serre.
#[derive(Debug, Clone)]
pub struct GreenhouseConfig {
    pub id: String,
    pub raspberries: Vec<String>,
    pub devices: Vec<(DeviceRecord, Zone)>,
    pub thresholds: ThresholdMap,
    pub effects: EffectsTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceContext {
    pub device_id: String,
    pub role: DeviceRole,
    pub zone: Zone,
    pub broker: BrokerEndpoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GreenhouseTopology {
    pub greenhouse_id: String,
    pub raspberries: Vec<String>,
    pub measurements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorDevice {
    pub device_id: String,
    pub system: String,
    pub zone: Zone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorDevice {
    pub device_id: String,
    pub zone: Zone,
    pub measurements: Vec<MeasurementRecord>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    broker: BrokerEndpoint,
    greenhouses: Vec<GreenhouseConfig>,
}

impl Catalog {
    pub fn from_document(doc: CatalogDocument) -> Result<Self, CatalogError> {
        Self::from_parts(doc.broker, doc.greenhouses)
    }

    pub fn from_parts(broker: BrokerEndpoint, records: Vec<GreenhouseRecord>) -> Result<Self, CatalogError> {
        let mut greenhouses = Vec::with_capacity(records.len());
        for record in records {
            greenhouses.push(build_greenhouse(record)?);
        }
        Ok(Self { broker, greenhouses })
    }

    pub async fn load_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let doc: CatalogDocument = serde_yaml::from_str(&raw)?;
        let catalog = Self::from_document(doc)?;
        info!(path = %path.display(), greenhouses = catalog.greenhouses.len(), "catalog loaded from file");
        Ok(catalog)
    }

    pub fn broker(&self) -> &BrokerEndpoint {
        &self.broker
    }

    pub fn greenhouse(&self, id: &str) -> Option<&GreenhouseConfig> {
        self.greenhouses.iter().find(|g| g.id == id)
    }

    pub fn thresholds(&self, greenhouse_id: &str) -> Option<&ThresholdMap> {
        self.greenhouse(greenhouse_id).map(|g| &g.thresholds)
    }

    pub fn effects(&self, greenhouse_id: &str) -> Option<&EffectsTable> {
        self.greenhouse(greenhouse_id).map(|g| &g.effects)
    }

    pub fn device_context(&self, device_id: &str) -> Option<DeviceContext> {
        self.greenhouses.iter().find_map(|g| {
            g.devices.iter().find(|(d, _)| d.id == device_id).map(|(d, zone)| DeviceContext {
                device_id: d.id.clone(),
                role: d.role(),
                zone: zone.clone(),
                broker: self.broker.clone(),
            })
        })
    }

    /// Serres avec leurs raspberries et les métriques mesurées par leurs capteurs.
    pub fn topology(&self) -> Vec<GreenhouseTopology> {
        self.greenhouses
            .iter()
            .map(|g| {
                let mut measurements: Vec<String> = Vec::new();
                for (device, _) in &g.devices {
                    for m in &device.measurements {
                        if !measurements.contains(&m.metric) {
                            measurements.push(m.metric.clone());
                        }
                    }
                }
                GreenhouseTopology {
                    greenhouse_id: g.id.clone(),
                    raspberries: g.raspberries.clone(),
                    measurements,
                }
            })
            .collect()
    }

    pub fn actuators(&self) -> Vec<ActuatorDevice> {
        self.devices_with_role(DeviceRole::Actuator)
            .map(|(d, zone)| ActuatorDevice {
                device_id: d.id.clone(),
                system: d.kind.clone(),
                zone: zone.clone(),
            })
            .collect()
    }

    pub fn sensors(&self) -> Vec<SensorDevice> {
        self.devices_with_role(DeviceRole::Sensor)
            .map(|(d, zone)| SensorDevice {
                device_id: d.id.clone(),
                zone: zone.clone(),
                measurements: d.measurements.clone(),
            })
            .collect()
    }

    fn devices_with_role(&self, role: DeviceRole) -> impl Iterator<Item = &(DeviceRecord, Zone)> {
        self.greenhouses
            .iter()
            .flat_map(|g| g.devices.iter())
            .filter(move |(d, _)| d.role() == role)
    }
}

fn build_greenhouse(record: GreenhouseRecord) -> Result<GreenhouseConfig, CatalogError> {
    let gh = record.id.clone();
    let thresholds = ThresholdMap::from_rows(record.thresholds).map_err(|source| CatalogError::Threshold {
        greenhouse: gh.clone(),
        source,
    })?;
    let effects = EffectsTable::from_records(record.effects).map_err(|source| CatalogError::Effects {
        greenhouse: gh.clone(),
        source,
    })?;

    let mut raspberries: Vec<String> = record
        .raspberries
        .into_iter()
        .map(|r| match r {
            RaspberryRef::Id(id) | RaspberryRef::Record { id } => id,
        })
        .collect();
    for device in &record.devices {
        if device.role() == DeviceRole::Raspberry && !raspberries.contains(&device.id) {
            raspberries.push(device.id.clone());
        }
    }

    let mut devices = Vec::with_capacity(record.devices.len());
    for mut device in record.devices {
        // nom canonique pour tout le monde : topics capteurs et requêtes de l'agrégateur
        for m in &mut device.measurements {
            m.metric = canonical_metric(&m.metric);
            if !is_known_metric(&m.metric) {
                return Err(CatalogError::UnknownMeasurement {
                    greenhouse: gh.clone(),
                    device: device.id.clone(),
                    metric: m.metric.clone(),
                });
            }
        }
        let rb = match device.role() {
            DeviceRole::Raspberry => Some(device.id.clone()),
            _ => device.raspberry_id.clone().or_else(|| raspberries.first().cloned()),
        };
        let Some(rb) = rb else {
            return Err(CatalogError::UnassignedDevice {
                greenhouse: gh.clone(),
                device: device.id.clone(),
            });
        };
        let zone = Zone::new(gh.clone(), rb);
        devices.push((device, zone));
    }

    debug!(greenhouse = %gh, raspberries = raspberries.len(), devices = devices.len(), "greenhouse validated");
    Ok(GreenhouseConfig {
        id: gh,
        raspberries,
        devices,
        thresholds,
        effects,
    })
}

/// Client du service catalogue HTTP.
pub struct HttpCatalog {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpCatalog {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub async fn login(&self) -> Result<String, CatalogError> {
        let body = serde_json::json!({"username": self.username, "password": self.password});
        let response: Value = self
            .http
            .post(format!("{}/login", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        token_from(&response).ok_or(CatalogError::MissingToken)
    }

    pub async fn broker(&self) -> Result<BrokerEndpoint, CatalogError> {
        let endpoint = self
            .http
            .get(format!("{}/broker", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(endpoint)
    }

    pub async fn greenhouses(&self, token: &str) -> Result<Vec<GreenhouseRecord>, CatalogError> {
        let response: GreenhousesResponse = self
            .http
            .get(format!("{}/retrieve/greenhouses", self.base_url))
            .header("token", token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.greenhouses)
    }

    pub async fn fetch(&self) -> Result<Catalog, CatalogError> {
        let token = self.login().await?;
        let broker = self.broker().await?;
        let greenhouses = self.greenhouses(&token).await?;
        let catalog = Catalog::from_parts(broker, greenhouses)?;
        info!(url = %self.base_url, greenhouses = catalog.greenhouses.len(), "catalog fetched");
        Ok(catalog)
    }
}

/// Le token arrive soit en objet, soit en chaîne JSON contenant cet objet.
fn token_from(response: &Value) -> Option<String> {
    match response {
        Value::Object(map) => map.get("token").and_then(Value::as_str).map(str::to_string),
        Value::String(inner) => serde_json::from_str::<Value>(inner).ok().as_ref().and_then(token_from),
        _ => None,
    }
}

pub async fn load_catalog(source: &CatalogSource) -> Result<Catalog, CatalogError> {
    match source {
        CatalogSource::File(path) => Catalog::load_file(path).await,
        CatalogSource::Http { url, username, password } => HttpCatalog::new(url, username, password)?.fetch().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn document() -> CatalogDocument {
        serde_json::from_value(json!({
            "broker": {"broker_ip": "10.0.0.5", "broker_port": "1883"},
            "greenhouses": [{
                "id": 1,
                "raspberries": [{"id": "rb1"}],
                "devices": [
                    {"id": "s-1", "name": "dht sensor", "type": "sensor",
                     "measurements": [{"type": "temperature", "unit": "C"}, {"type": "PH"}]},
                    {"id": "a-1", "name": "fan", "type": "ventilation_system"},
                    {"id": "a-2", "name": "lamp", "type": "illumination_system", "raspberry_id": "rb2"},
                    {"id": "rb2", "name": "pi", "type": "raspberry"}
                ],
                "thresholds": [
                    {"metric": "temperature", "lower": 18, "upper": 26, "deadband": 0.5},
                    {"metric": "light", "lower": 5000, "upper": 15000, "deadband": 50}
                ],
                "effects": [
                    {"system": "ventilation_system", "level": "100%", "temperature": -0.0167},
                    {"system": "illumination_system", "level": "50%", "light": 300}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn classifies_devices_and_zones() {
        let catalog = Catalog::from_document(document()).unwrap();
        assert_eq!(catalog.broker().broker_port, 1883);

        let sensor = catalog.device_context("s-1").unwrap();
        assert_eq!(sensor.role, DeviceRole::Sensor);
        assert_eq!(sensor.zone, Zone::new("1", "rb1"));

        let lamp = catalog.device_context("a-2").unwrap();
        assert_eq!(lamp.role, DeviceRole::Actuator);
        assert_eq!(lamp.zone, Zone::new("1", "rb2"));

        let systems: Vec<String> = catalog.actuators().into_iter().map(|a| a.system).collect();
        assert_eq!(systems, vec!["ventilation_system", "illumination_system"]);
        assert_eq!(catalog.sensors().len(), 1);
        assert!(catalog.device_context("missing").is_none());
    }

    #[test]
    fn topology_lists_raspberries_and_metrics() {
        let catalog = Catalog::from_document(document()).unwrap();
        let topology = catalog.topology();
        assert_eq!(topology.len(), 1);
        assert_eq!(topology[0].raspberries, vec!["rb1", "rb2"]);
        assert_eq!(topology[0].measurements, vec!["temperature", "pH"]);
        assert_eq!(catalog.thresholds("1").unwrap().len(), 2);
        assert_eq!(catalog.effects("1").unwrap().levels("ventilation_system"), vec![0, 100]);
    }

    #[test]
    fn invalid_thresholds_are_fatal() {
        let mut doc = document();
        doc.greenhouses[0].thresholds.push(ThresholdRow {
            metric: "humidity".into(),
            lower: Some(60.0),
            upper: None,
            deadband: None,
        });
        assert!(matches!(Catalog::from_document(doc), Err(CatalogError::Threshold { .. })));
    }

    #[test]
    fn sensor_metrics_match_aggregated_metrics() {
        let catalog = Catalog::from_document(document()).unwrap();
        let sensor: Vec<String> = catalog.sensors()[0].measurements.iter().map(|m| m.metric.clone()).collect();
        assert_eq!(sensor, catalog.topology()[0].measurements);
        assert_eq!(sensor, vec!["temperature", "pH"]);
    }

    #[test]
    fn unknown_measurement_is_fatal() {
        let mut doc = document();
        doc.greenhouses[0].devices[0].measurements.push(MeasurementRecord {
            metric: "co2".into(),
            unit: Some("ppm".into()),
        });
        match Catalog::from_document(doc) {
            Err(CatalogError::UnknownMeasurement { greenhouse, device, metric }) => {
                assert_eq!((greenhouse.as_str(), device.as_str(), metric.as_str()), ("1", "s-1", "co2"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn device_without_raspberry_is_rejected() {
        let doc: CatalogDocument = serde_json::from_value(json!({
            "broker": {"broker_ip": "localhost", "broker_port": 1883},
            "greenhouses": [{"id": "gh1", "devices": [{"id": "a-1", "type": "heating_system"}]}]
        }))
        .unwrap();
        assert!(matches!(Catalog::from_document(doc), Err(CatalogError::UnassignedDevice { .. })));
    }

    #[test]
    fn token_is_read_from_nested_string() {
        assert_eq!(token_from(&json!({"token": "abc"})), Some("abc".into()));
        assert_eq!(token_from(&json!("{\"token\": \"xyz\"}")), Some("xyz".into()));
        assert_eq!(token_from(&json!({"user": "x"})), None);
    }
}
