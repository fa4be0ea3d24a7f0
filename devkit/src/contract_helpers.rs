/*!
Fixtures conformes aux documents du catalogue et aux payloads du bus

- Seuils et table d'effets construits via les mêmes parseurs que le catalogue
- Payloads JSON : snapshot de zone, message d'effet actionneur, commande
*/

use anyhow::Result;
use greenbox_kernel::effects::{EffectRecord, EffectsTable};
use greenbox_kernel::threshold::{ThresholdMap, ThresholdRow};
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Lignes `(metric, lower, upper, deadband)`.
pub fn thresholds(rows: &[(&str, f64, f64, f64)]) -> Result<ThresholdMap> {
    let rows = rows.iter().map(|(metric, lower, upper, deadband)| ThresholdRow {
        metric: metric.to_string(),
        lower: Some(*lower),
        upper: Some(*upper),
        deadband: Some(*deadband),
    });
    Ok(ThresholdMap::from_rows(rows)?)
}

/// Lignes `(system, level, [(colonne, valeur)])` ; les colonnes incluent
/// `energy_consumption` et `water_consumption`.
pub fn effects_table(rows: &[(&str, u8, &[(&str, f64)])]) -> Result<EffectsTable> {
    let mut records = Vec::with_capacity(rows.len());
    for (system, level, cells) in rows {
        let mut row = Map::new();
        row.insert("system".into(), json!(system));
        row.insert("level".into(), json!(format!("{level}%")));
        for (column, value) in cells.iter() {
            row.insert(column.to_string(), json!(value));
        }
        records.push(serde_json::from_value::<EffectRecord>(Value::Object(row))?);
    }
    Ok(EffectsTable::from_records(records)?)
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

pub struct GreenboxMessageBuilder;

impl GreenboxMessageBuilder {
    /// Snapshot `statistics/state` avec des médianes.
    pub fn snapshot(greenhouse_id: &str, raspberry_id: &str, medians: &[(&str, f64)]) -> Value {
        let metrics: Map<String, Value> = medians
            .iter()
            .map(|(metric, median)| (metric.to_string(), json!({"median": median})))
            .collect();
        json!({
            "timestamp_utc": now_rfc3339(),
            "greenhouse_id": greenhouse_id,
            "raspberry_id": raspberry_id,
            "metrics": metrics,
        })
    }

    /// Message d'effet publié par un actionneur.
    pub fn actuator_data(actuator_id: &str, system: &str, level: u8, deltas: &[(&str, f64)]) -> Value {
        let mut payload = json!({
            "id": actuator_id,
            "timestamp": now_rfc3339(),
            "seconds_since_on": 10,
            "system": system,
            "level": level,
            "energy_consumption": 0.0,
            "water_consumption": 0.0,
        });
        if let Value::Object(obj) = &mut payload {
            for (metric, value) in deltas {
                obj.insert(format!("delta_{metric}"), json!(value));
            }
        }
        payload
    }

    pub fn command(cmd: &str, level: Value) -> Value {
        json!({"cmd": cmd, "level": level})
    }
}
