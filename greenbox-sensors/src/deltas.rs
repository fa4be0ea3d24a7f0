//! Actuator effect superposition.
//!
//! Keeps the latest `delta_<metric>` published by each actuator of the zone.
//! Values are overwritten per (actuator, metric) and never cleared: they
//! describe the current influence of every actuator, not an event.

use greenbox_kernel::bus::MessageHandler;
use greenbox_kernel::threshold::canonical_metric;
use greenbox_kernel::topics;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{trace, warn};

const DELTA_PREFIX: &str = "delta_";

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("no actuator id in topic {0}")]
    Topic(String),
    #[error("invalid effect payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("effect payload is not a JSON object")]
    NotAnObject,
}

/// Sum of the latest deltas for one metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contribution {
    pub total: f64,
    /// Actuator ids, sorted.
    pub contributors: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DeltaInjector {
    latest: Mutex<BTreeMap<String, BTreeMap<String, f64>>>,
}

impl DeltaInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the `delta_*` fields of an actuator data message; returns how many were kept.
    pub fn record(&self, topic: &str, payload: &[u8]) -> Result<usize, DeltaError> {
        let actuator_id = topics::actuator_id_from_data_topic(topic)
            .ok_or_else(|| DeltaError::Topic(topic.to_string()))?;
        let Value::Object(fields) = serde_json::from_slice::<Value>(payload)? else {
            return Err(DeltaError::NotAnObject);
        };

        let mut latest = self.latest.lock();
        let slot = latest.entry(actuator_id.to_string()).or_default();
        let mut kept = 0;
        for (key, value) in fields {
            let Some(metric) = key.strip_prefix(DELTA_PREFIX) else {
                continue;
            };
            // non-numeric deltas are skipped, the rest of the message still counts
            if let Some(v) = value.as_f64() {
                slot.insert(canonical_metric(metric), v);
                kept += 1;
            }
        }
        trace!(actuator = actuator_id, kept, "actuator deltas updated");
        Ok(kept)
    }

    pub fn contribution(&self, metric: &str) -> Contribution {
        let metric = canonical_metric(metric);
        let latest = self.latest.lock();
        let mut contribution = Contribution::default();
        for (actuator_id, deltas) in latest.iter() {
            if let Some(v) = deltas.get(&metric) {
                contribution.total += v;
                contribution.contributors.push(actuator_id.clone());
            }
        }
        contribution
    }
}

impl MessageHandler for DeltaInjector {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.record(topic, payload) {
            warn!(topic, error = %e, "actuator data dropped");
        }
    }
}
