//! Table des effets : ce que chaque couple (système, niveau) fait à chaque métrique.
//!
//! La lumière est un décalage instantané, toute autre métrique un taux par
//! seconde. Énergie et eau sont des consommations par seconde.

use crate::threshold::{canonical_metric, is_known_metric};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub const ILLUMINATION_SYSTEM: &str = "illumination_system";
pub const ENERGY_COLUMN: &str = "energy_consumption";
pub const WATER_COLUMN: &str = "water_consumption";

#[derive(Debug, Error, PartialEq)]
pub enum EffectsError {
    #[error("invalid level '{0}' (expected 0..=100, optionally suffixed with %)")]
    InvalidLevel(String),
    #[error("unknown metric column '{0}'")]
    UnknownMetric(String),
    #[error("invalid value '{value}' in column '{column}'")]
    InvalidCell { column: String, value: String },
    #[error("duplicate effects row for {system} at level {level}")]
    DuplicateRow { system: String, level: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    /// Variation par seconde tant que l'actionneur est allumé.
    Rate(f64),
    /// Décalage constant tant que l'actionneur est allumé.
    Instantaneous(f64),
}

impl Effect {
    pub fn for_metric(metric: &str, value: f64) -> Self {
        if is_instantaneous_metric(metric) {
            Effect::Instantaneous(value)
        } else {
            Effect::Rate(value)
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Effect::Rate(v) | Effect::Instantaneous(v) => *v,
        }
    }

    /// Contribution après `elapsed_s` secondes d'allumage.
    pub fn delta_after(&self, elapsed_s: f64) -> f64 {
        match self {
            Effect::Rate(rate) => rate * elapsed_s,
            Effect::Instantaneous(v) => *v,
        }
    }
}

pub fn is_instantaneous_metric(metric: &str) -> bool {
    matches!(metric, "light" | "light_natural")
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectRow {
    pub level: u8,
    pub effects: BTreeMap<String, Effect>,
    pub energy_consumption: f64,
    pub water_consumption: f64,
}

impl EffectRow {
    pub fn neutral(level: u8) -> Self {
        Self {
            level,
            effects: BTreeMap::new(),
            energy_consumption: 0.0,
            water_consumption: 0.0,
        }
    }

    pub fn effect(&self, metric: &str) -> Option<Effect> {
        self.effects.get(metric).copied()
    }

    /// Taux par seconde sur `metric` ; un effet instantané n'a pas de taux.
    pub fn rate(&self, metric: &str) -> f64 {
        match self.effects.get(metric) {
            Some(Effect::Rate(r)) => *r,
            _ => 0.0,
        }
    }
}

/// Niveau tel qu'écrit dans un document : `50`, `50.0` ou `"50%"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LevelValue {
    Number(f64),
    Text(String),
}

impl LevelValue {
    pub fn to_level(&self) -> Result<u8, EffectsError> {
        match self {
            LevelValue::Number(n) => level_from_f64(*n).ok_or_else(|| EffectsError::InvalidLevel(n.to_string())),
            LevelValue::Text(s) => parse_level(s),
        }
    }
}

pub fn parse_level(raw: &str) -> Result<u8, EffectsError> {
    let cleaned = raw.trim().trim_end_matches('%').trim();
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(level_from_f64)
        .ok_or_else(|| EffectsError::InvalidLevel(raw.to_string()))
}

fn level_from_f64(n: f64) -> Option<u8> {
    if n.is_finite() && n.fract() == 0.0 && (0.0..=100.0).contains(&n) {
        Some(n as u8)
    } else {
        None
    }
}

/// Une ligne d'effets telle que lue dans le catalogue.
#[derive(Debug, Clone, Deserialize)]
pub struct EffectRecord {
    pub system: String,
    pub level: LevelValue,
    #[serde(flatten)]
    pub cells: BTreeMap<String, Value>,
}

fn cell_value(column: &str, value: &Value) -> Result<f64, EffectsError> {
    let invalid = || EffectsError::InvalidCell {
        column: column.to_string(),
        value: value.to_string(),
    };
    match value {
        Value::Null => Ok(0.0),
        Value::Number(n) => n.as_f64().ok_or_else(invalid),
        Value::String(s) if s.trim().is_empty() => Ok(0.0),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

impl EffectRecord {
    fn into_row(self) -> Result<(String, EffectRow), EffectsError> {
        let level = self.level.to_level()?;
        let mut row = EffectRow::neutral(level);
        for (column, value) in &self.cells {
            let v = cell_value(column, value)?;
            match column.as_str() {
                ENERGY_COLUMN => row.energy_consumption = v,
                WATER_COLUMN => row.water_consumption = v,
                other => {
                    let metric = canonical_metric(other);
                    if !is_known_metric(&metric) {
                        return Err(EffectsError::UnknownMetric(other.to_string()));
                    }
                    row.effects.insert(metric.clone(), Effect::for_metric(&metric, v));
                }
            }
        }
        Ok((self.system.trim().to_string(), row))
    }
}

/// Effets d'une serre, indexés par système puis niveau.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectsTable {
    systems: BTreeMap<String, BTreeMap<u8, EffectRow>>,
}

impl EffectsTable {
    pub fn from_records(records: impl IntoIterator<Item = EffectRecord>) -> Result<Self, EffectsError> {
        let mut table = EffectsTable::default();
        for record in records {
            let (system, row) = record.into_row()?;
            let levels = table.systems.entry(system.clone()).or_default();
            if levels.contains_key(&row.level) {
                return Err(EffectsError::DuplicateRow { system, level: row.level });
            }
            levels.insert(row.level, row);
        }
        for levels in table.systems.values_mut() {
            levels.entry(0).or_insert_with(|| EffectRow::neutral(0));
        }
        Ok(table)
    }

    /// Ajoute ou remplace une ligne ; le niveau 0 reste présent pour le système.
    pub fn insert(&mut self, system: &str, row: EffectRow) {
        let levels = self.systems.entry(system.to_string()).or_default();
        levels.entry(0).or_insert_with(|| EffectRow::neutral(0));
        levels.insert(row.level, row);
    }

    pub fn row(&self, system: &str, level: u8) -> Option<&EffectRow> {
        self.systems.get(system).and_then(|levels| levels.get(&level))
    }

    /// Ligne du couple, ou ligne vide si le couple est inconnu.
    pub fn row_or_neutral(&self, system: &str, level: u8) -> EffectRow {
        self.row(system, level).cloned().unwrap_or_else(|| EffectRow::neutral(level))
    }

    pub fn rows(&self, system: &str) -> Option<&BTreeMap<u8, EffectRow>> {
        self.systems.get(system)
    }

    /// Niveaux de `system`, croissants.
    pub fn levels(&self, system: &str) -> Vec<u8> {
        self.systems
            .get(system)
            .map(|levels| levels.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn systems(&self) -> impl Iterator<Item = &str> {
        self.systems.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}
