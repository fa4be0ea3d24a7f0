//! Bandes de seuils par métrique.
//!
//! Un seuil `(lower, upper, deadband)` donne la bande de travail
//! `[lower + deadband, upper - deadband]` ; si la zone morte inverse la bande,
//! on retombe sur les bornes brutes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Métriques connues du plan de contrôle.
pub const KNOWN_METRICS: &[&str] = &[
    "temperature",
    "humidity",
    "soil_humidity",
    "light",
    "light_natural",
    "pH",
];

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("threshold for '{0}' is missing a lower or upper bound")]
    MissingBounds(String),
    #[error("unknown metric '{0}'")]
    UnknownMetric(String),
    #[error("threshold for '{metric}' has lower {lower} above upper {upper}")]
    InvertedBounds { metric: String, lower: f64, upper: f64 },
    #[error("threshold for '{metric}' has negative deadband {deadband}")]
    NegativeDeadband { metric: String, deadband: f64 },
}

/// Normalise un nom de métrique : toute graphie de "ph" (`PH`, `p-h`, `P_h`) devient `pH`.
pub fn canonical_metric(name: &str) -> String {
    let trimmed = name.trim();
    let folded: String = trimmed
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect::<String>()
        .to_lowercase();
    if folded == "ph" {
        "pH".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn is_known_metric(name: &str) -> bool {
    KNOWN_METRICS.contains(&name)
}

/// Intervalle fermé `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub lo: f64,
    pub hi: f64,
}

impl Band {
    pub fn contains(&self, x: f64) -> bool {
        self.lo <= x && x <= self.hi
    }

    /// Distance de `x` à la bande, 0 à l'intérieur.
    pub fn violation(&self, x: f64) -> f64 {
        if !x.is_finite() {
            return ((self.lo + self.hi) / 2.0).abs();
        }
        if x < self.lo {
            self.lo - x
        } else if x > self.hi {
            x - self.hi
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub lower: f64,
    pub upper: f64,
    #[serde(default)]
    pub deadband: f64,
}

impl Threshold {
    pub fn new(lower: f64, upper: f64, deadband: f64) -> Self {
        Self { lower, upper, deadband }
    }

    pub fn band(&self) -> Band {
        let lo = self.lower + self.deadband;
        let hi = self.upper - self.deadband;
        if lo <= hi {
            Band { lo, hi }
        } else {
            Band { lo: self.lower, hi: self.upper }
        }
    }

    pub fn in_band(&self, x: f64) -> bool {
        self.band().contains(x)
    }

    /// Milieu des bornes brutes (pas de la bande).
    pub fn center(&self) -> f64 {
        (self.lower + self.upper) / 2.0
    }
}

/// Une ligne de seuil telle que lue dans le catalogue.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdRow {
    pub metric: String,
    #[serde(default, alias = "min")]
    pub lower: Option<f64>,
    #[serde(default, alias = "max")]
    pub upper: Option<f64>,
    #[serde(default, alias = "dead_band", alias = "tolerance")]
    pub deadband: Option<f64>,
}

impl ThresholdRow {
    fn into_threshold(self) -> Result<(String, Threshold), ThresholdError> {
        let metric = canonical_metric(&self.metric);
        if !is_known_metric(&metric) {
            return Err(ThresholdError::UnknownMetric(metric));
        }
        let (Some(lower), Some(upper)) = (self.lower, self.upper) else {
            return Err(ThresholdError::MissingBounds(metric));
        };
        if lower > upper {
            return Err(ThresholdError::InvertedBounds { metric, lower, upper });
        }
        let deadband = self.deadband.unwrap_or(0.0);
        if deadband < 0.0 {
            return Err(ThresholdError::NegativeDeadband { metric, deadband });
        }
        Ok((metric, Threshold::new(lower, upper, deadband)))
    }
}

/// Seuils d'une serre, indexés par nom canonique de métrique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdMap {
    entries: BTreeMap<String, Threshold>,
}

impl ThresholdMap {
    pub fn from_rows(rows: impl IntoIterator<Item = ThresholdRow>) -> Result<Self, ThresholdError> {
        let mut entries = BTreeMap::new();
        for row in rows {
            let (metric, threshold) = row.into_threshold()?;
            entries.insert(metric, threshold);
        }
        Ok(Self { entries })
    }

    pub fn insert(&mut self, metric: &str, threshold: Threshold) {
        self.entries.insert(canonical_metric(metric), threshold);
    }

    pub fn get(&self, metric: &str) -> Option<&Threshold> {
        self.entries.get(&canonical_metric(metric))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Threshold)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Threshold)> for ThresholdMap {
    fn from_iter<I: IntoIterator<Item = (String, Threshold)>>(iter: I) -> Self {
        let mut map = ThresholdMap::default();
        for (metric, threshold) in iter {
            map.insert(&metric, threshold);
        }
        map
    }
}
