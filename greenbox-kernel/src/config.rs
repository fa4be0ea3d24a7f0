//! Configuration par variables d'environnement, commune aux démons.
//!
//! `.env` est lu d'abord (dotenvy), puis l'environnement du processus. Chaque
//! démon ne lit que ce dont il a besoin ; un nombre invalide est fatal.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Provenance du catalogue.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogSource {
    File(PathBuf),
    Http {
        url: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GreenboxConfig {
    pub catalog: CatalogSource,
    pub stats_window: Duration,
    pub aggregation_interval: Duration,
    pub sensor_interval: Duration,
    pub actuator_publish_period: Duration,
    pub energy_weight: f64,
    pub water_weight: f64,
    pub horizon_cap_s: Option<f64>,
    pub device_filter: Option<String>,
}

impl GreenboxConfig {
    /// Charge `.env` s'il existe puis lit l'environnement du processus.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let catalog = match get("GREENBOX_CATALOG_FILE") {
            Some(path) => CatalogSource::File(PathBuf::from(path)),
            None => CatalogSource::Http {
                url: get("CATALOG_URL").ok_or(ConfigError::Missing("CATALOG_URL"))?,
                username: get("USER").ok_or(ConfigError::Missing("USER"))?,
                password: get("PASSWORD").ok_or(ConfigError::Missing("PASSWORD"))?,
            },
        };

        let window_minutes: f64 = parse_or(&get, "STATS_WINDOW_MINUTES", 5.0)?;
        let interval_s: f64 = parse_or(&get, "STATS_AGGREGATION_INTERVAL_S", 10.0)?;
        let sensor_s: f64 = parse_or(&get, "TIME_INTERVAL_SENSORS", 5.0)?;
        let actuator_s: f64 = parse_or(&get, "ACTUATOR_PUBLISH_PERIOD_S", 5.0)?;

        Ok(Self {
            catalog,
            stats_window: positive_duration("STATS_WINDOW_MINUTES", window_minutes * 60.0)?,
            aggregation_interval: positive_duration("STATS_AGGREGATION_INTERVAL_S", interval_s)?,
            sensor_interval: positive_duration("TIME_INTERVAL_SENSORS", sensor_s)?,
            actuator_publish_period: positive_duration("ACTUATOR_PUBLISH_PERIOD_S", actuator_s)?,
            energy_weight: parse_or(&get, "GREENBOX_ENERGY_WEIGHT", 1.0)?,
            water_weight: parse_or(&get, "GREENBOX_WATER_WEIGHT", 1.0)?,
            horizon_cap_s: get("GREENBOX_HORIZON_CAP_S")
                .map(|raw| parse_value("GREENBOX_HORIZON_CAP_S", &raw))
                .transpose()?,
            device_filter: get("GREENBOX_DEVICE_ID"),
        })
    }
}

fn parse_value<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        var,
        value: raw.to_string(),
    })
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}

fn positive_duration(var: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    if secs.is_finite() && secs > 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(ConfigError::Invalid {
            var,
            value: secs.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<GreenboxConfig, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        GreenboxConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("GREENBOX_CATALOG_FILE", "catalog.yaml")]).unwrap();
        assert_eq!(cfg.catalog, CatalogSource::File(PathBuf::from("catalog.yaml")));
        assert_eq!(cfg.stats_window, Duration::from_secs(300));
        assert_eq!(cfg.aggregation_interval, Duration::from_secs(10));
        assert_eq!(cfg.sensor_interval, Duration::from_secs(5));
        assert_eq!(cfg.actuator_publish_period, Duration::from_secs(5));
        assert_eq!(cfg.energy_weight, 1.0);
        assert_eq!(cfg.horizon_cap_s, None);
    }

    #[test]
    fn http_catalog_needs_credentials() {
        assert_eq!(
            config(&[("CATALOG_URL", "http://catalog:8080/")]),
            Err(ConfigError::Missing("USER"))
        );
        let cfg = config(&[
            ("CATALOG_URL", "http://catalog:8080/"),
            ("USER", "admin"),
            ("PASSWORD", "secret"),
            ("STATS_WINDOW_MINUTES", "2"),
            ("GREENBOX_HORIZON_CAP_S", "600"),
        ])
        .unwrap();
        assert!(matches!(cfg.catalog, CatalogSource::Http { .. }));
        assert_eq!(cfg.stats_window, Duration::from_secs(120));
        assert_eq!(cfg.horizon_cap_s, Some(600.0));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert!(matches!(
            config(&[("GREENBOX_CATALOG_FILE", "c.yaml"), ("TIME_INTERVAL_SENSORS", "fast")]),
            Err(ConfigError::Invalid { var: "TIME_INTERVAL_SENSORS", .. })
        ));
        assert!(matches!(
            config(&[("GREENBOX_CATALOG_FILE", "c.yaml"), ("STATS_AGGREGATION_INTERVAL_S", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
