//! Sensor value sources.
//!
//! `SimulatedReader` stands in for hardware: each metric oscillates slowly
//! around the centre of its threshold range.

use greenbox_kernel::threshold::{canonical_metric, ThresholdMap};
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq)]
pub enum ReadError {
    #[error("no source for metric '{0}'")]
    UnknownMetric(String),
}

pub trait SensorReader: Send {
    fn read(&mut self, metric: &str) -> Result<f64, ReadError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Drift {
    center: f64,
    amplitude: f64,
}

pub struct SimulatedReader {
    drifts: HashMap<String, Drift>,
    period: Duration,
    started: Instant,
}

impl SimulatedReader {
    pub const DEFAULT_PERIOD: Duration = Duration::from_secs(3600);

    /// Amplitude is a quarter of the threshold range.
    pub fn from_thresholds(thresholds: &ThresholdMap) -> Self {
        let drifts = thresholds
            .iter()
            .map(|(metric, t)| {
                let drift = Drift {
                    center: t.center(),
                    amplitude: (t.upper - t.lower).abs() / 4.0,
                };
                (metric.to_string(), drift)
            })
            .collect();
        Self {
            drifts,
            period: Self::DEFAULT_PERIOD,
            started: Instant::now(),
        }
    }

    pub fn value_at(&self, metric: &str, elapsed: Duration) -> Result<f64, ReadError> {
        let drift = self
            .drifts
            .get(&canonical_metric(metric))
            .ok_or_else(|| ReadError::UnknownMetric(metric.to_string()))?;
        let phase = if self.period.is_zero() {
            0.0
        } else {
            TAU * elapsed.as_secs_f64() / self.period.as_secs_f64()
        };
        Ok(drift.center + drift.amplitude * phase.sin())
    }
}

impl SensorReader for SimulatedReader {
    fn read(&mut self, metric: &str) -> Result<f64, ReadError> {
        self.value_at(metric, self.started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbox_devkit::thresholds;

    fn reader() -> SimulatedReader {
        let t = thresholds(&[("temperature", 18.0, 26.0, 0.5), ("ph", 5.8, 6.6, 0.0)]).unwrap();
        let mut reader = SimulatedReader::from_thresholds(&t);
        reader.period = Duration::from_secs(400);
        reader
    }

    #[test]
    fn oscillates_around_threshold_center() {
        let r = reader();
        assert!((r.value_at("temperature", Duration::ZERO).unwrap() - 22.0).abs() < 1e-9);
        assert!((r.value_at("temperature", Duration::from_secs(100)).unwrap() - 24.0).abs() < 1e-9);
        assert!((r.value_at("temperature", Duration::from_secs(300)).unwrap() - 20.0).abs() < 1e-9);
        assert!((r.value_at("PH", Duration::ZERO).unwrap() - 6.2).abs() < 1e-9);
    }

    #[test]
    fn unknown_metric_is_an_error() {
        let mut r = reader();
        assert_eq!(r.read("co2"), Err(ReadError::UnknownMetric("co2".into())));
    }
}
