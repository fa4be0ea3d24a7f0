//! Client en lecture seule de la base de séries temporelles des capteurs.
//!
//! Les requêtes sont validées contre un ensemble fermé de métriques et de
//! plages avant d'être rendues en SQL : aucun identifiant fourni par
//! l'appelant n'atteint le texte de la requête, les littéraux sont échappés.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

pub const METRICS: &[&str] = &["temperature", "humidity", "pH", "light", "light_natural", "soil_humidity"];
pub const MAX_LIMIT: usize = 10_000;
pub const DEFAULT_LIMIT: usize = 1_000;

#[derive(Debug, Error)]
pub enum TsdbError {
    #[error("unsupported metric '{0}'")]
    UnsupportedMetric(String),
    #[error("unsupported time range '{0}'")]
    UnsupportedTimeRange(String),
    #[error("invalid timestamp: {0}")]
    Time(#[from] time::error::Format),
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected store response: {0}")]
    Response(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    LastHour,
    Last24Hours,
    Last7Days,
    Last30Days,
}

impl TimeRange {
    fn interval(&self) -> &'static str {
        match self {
            TimeRange::LastHour => "1 hour",
            TimeRange::Last24Hours => "24 hours",
            TimeRange::Last7Days => "7 days",
            TimeRange::Last30Days => "30 days",
        }
    }
}

impl FromStr for TimeRange {
    type Err = TsdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_hour" => Ok(TimeRange::LastHour),
            "last_24_hours" => Ok(TimeRange::Last24Hours),
            "last_7_days" => Ok(TimeRange::Last7Days),
            "last_30_days" => Ok(TimeRange::Last30Days),
            other => Err(TsdbError::UnsupportedTimeRange(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleQuery {
    pub metric: String,
    pub time_range: Option<TimeRange>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub site: Option<String>,
    pub device: Option<String>,
    pub limit: usize,
    pub order_desc: bool,
}

impl SampleQuery {
    pub fn new(metric: &str) -> Self {
        Self {
            metric: metric.to_string(),
            time_range: None,
            start: None,
            end: None,
            site: None,
            device: None,
            limit: DEFAULT_LIMIT,
            order_desc: true,
        }
    }

    pub fn time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn between(mut self, start: OffsetDateTime, end: OffsetDateTime) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn site(mut self, site: &str) -> Self {
        self.site = Some(site.to_string());
        self
    }

    pub fn device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Plafonné à [`MAX_LIMIT`].
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.min(MAX_LIMIT);
        self
    }

    pub fn ascending(mut self) -> Self {
        self.order_desc = false;
        self
    }

    pub fn to_sql(&self) -> Result<String, TsdbError> {
        if !METRICS.contains(&self.metric.as_str()) {
            return Err(TsdbError::UnsupportedMetric(self.metric.clone()));
        }
        let mut clauses = vec![format!("metric = '{}'", escape(&self.metric))];
        if let Some(range) = self.time_range {
            clauses.push(format!("time >= now() - INTERVAL '{}'", range.interval()));
        }
        if let Some(start) = self.start {
            clauses.push(format!("time >= '{}'", start.format(&Rfc3339)?));
        }
        if let Some(end) = self.end {
            clauses.push(format!("time <= '{}'", end.format(&Rfc3339)?));
        }
        if let Some(site) = &self.site {
            clauses.push(format!("site = '{}'", escape(site)));
        }
        if let Some(device) = &self.device {
            clauses.push(format!("device = '{}'", escape(device)));
        }
        let order = if self.order_desc { "DESC" } else { "ASC" };
        Ok(format!(
            "SELECT time, value, site, device, metric FROM sensor_data WHERE {} ORDER BY time {} LIMIT {}",
            clauses.join(" AND "),
            order,
            self.limit.min(MAX_LIMIT)
        ))
    }
}

fn escape(literal: &str) -> String {
    literal.replace('\'', "''")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: String,
    pub value: f64,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    pub metric: String,
}

#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn read(&self, query: &SampleQuery) -> Result<Vec<Sample>, TsdbError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfluxSettings {
    pub url: String,
    pub token: Option<String>,
    pub database: String,
    pub org: Option<String>,
}

impl InfluxSettings {
    pub fn from_env() -> Result<Self, TsdbError> {
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Ok(Self {
            url: get("INFLUXDB_URL").ok_or(TsdbError::MissingEnv("INFLUXDB_URL"))?,
            token: get("INFLUXDB_TOKEN"),
            database: get("INFLUXDB_BUCKET").ok_or(TsdbError::MissingEnv("INFLUXDB_BUCKET"))?,
            org: get("INFLUXDB_ORG"),
        })
    }
}

/// Endpoint SQL d'InfluxDB 3.
pub struct InfluxReader {
    http: reqwest::Client,
    settings: InfluxSettings,
}

impl InfluxReader {
    pub fn new(settings: InfluxSettings) -> Result<Self, TsdbError> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { http, settings })
    }
}

#[async_trait]
impl SampleStore for InfluxReader {
    async fn read(&self, query: &SampleQuery) -> Result<Vec<Sample>, TsdbError> {
        let sql = query.to_sql()?;
        debug!(metric = %query.metric, sql = %sql, "tsdb query");
        let url = format!("{}/api/v3/query_sql", self.settings.url.trim_end_matches('/'));
        let mut request = self.http.post(url).json(&serde_json::json!({
            "db": self.settings.database,
            "q": sql,
            "format": "json",
        }));
        if let Some(token) = &self.settings.token {
            request = request.bearer_auth(token);
        }
        let body: Value = request.send().await?.error_for_status()?.json().await?;
        decode_rows(body)
    }
}

fn decode_rows(body: Value) -> Result<Vec<Sample>, TsdbError> {
    let Value::Array(rows) = body else {
        return Err(TsdbError::Response("expected a JSON array of rows".into()));
    };
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| TsdbError::Response(e.to_string())))
        .collect()
}
