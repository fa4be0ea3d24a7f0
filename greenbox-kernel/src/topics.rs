//! Arborescence des topics du bus.
//!
//! ```text
//! /<gh>/<rb>/sensors/<device>/<metric>
//! /<gh>/<rb>/actuators/<system>/cmd
//! /<gh>/<rb>/actuators/<system>/<actuator_id>/data
//! /<gh>/<rb>/statistics/state
//! /<gh>/<rb>/alerts/ph
//! ```

use crate::models::Zone;

/// Snapshot statistique de toutes les zones.
pub const STATISTICS_STATE_FILTER: &str = "/+/+/statistics/state";

pub fn sensors_base(zone: &Zone) -> String {
    format!("/{}/{}/sensors/", zone.greenhouse_id, zone.raspberry_id)
}

pub fn sensor_reading(zone: &Zone, device_id: &str, metric: &str) -> String {
    format!("{}{}/{}", sensors_base(zone), device_id, metric)
}

pub fn actuator_cmd(zone: &Zone, system: &str) -> String {
    format!("/{}/{}/actuators/{}/cmd", zone.greenhouse_id, zone.raspberry_id, system)
}

pub fn actuator_data(zone: &Zone, system: &str, actuator_id: &str) -> String {
    format!(
        "/{}/{}/actuators/{}/{}/data",
        zone.greenhouse_id, zone.raspberry_id, system, actuator_id
    )
}

/// Tous les messages d'effet des actionneurs d'une zone.
pub fn actuator_data_filter(zone: &Zone) -> String {
    format!("/{}/{}/actuators/+/+/data", zone.greenhouse_id, zone.raspberry_id)
}

pub fn statistics_state(zone: &Zone) -> String {
    format!("/{}/{}/statistics/state", zone.greenhouse_id, zone.raspberry_id)
}

pub fn ph_alert(zone: &Zone) -> String {
    format!("/{}/{}/alerts/ph", zone.greenhouse_id, zone.raspberry_id)
}

/// Id d'actionneur d'un topic d'effet : deux segments après `actuators`.
pub fn actuator_id_from_data_topic(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    let idx = parts.iter().position(|p| *p == "actuators")?;
    parts.get(idx + 2).copied().filter(|id| !id.is_empty())
}

/// Correspondance de filtre MQTT (jokers `+` et `#`).
pub fn matches(topic: &str, filter: &str) -> bool {
    rumqttc::matches(topic, filter)
}
