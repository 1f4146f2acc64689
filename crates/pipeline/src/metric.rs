use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// How a metric's samples are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Point-in-time value, aggregated as-is.
    Gauge,
    /// Monotonic counter, aggregated as a per-second rate.
    Counter,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

impl FromStr for MetricType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gauge" => Ok(MetricType::Gauge),
            "counter" => Ok(MetricType::Counter),
            other => Err(Error::InvalidMetricType(other.to_string())),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub number: f64,
}

impl Metric {
    pub fn gauge(name: impl Into<String>, number: f64) -> Self {
        Self {
            name: name.into(),
            metric_type: MetricType::Gauge,
            number,
        }
    }

    pub fn counter(name: impl Into<String>, number: f64) -> Self {
        Self {
            name: name.into(),
            metric_type: MetricType::Counter,
            number,
        }
    }
}

/// Metrics produced by one monitor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    /// Unix timestamp (seconds) at which the monitor started collecting.
    pub start_ts: i64,
    pub metrics: Vec<Metric>,
}

impl Collection {
    pub fn new(start_ts: i64, metrics: Vec<Metric>) -> Self {
        Self { start_ts, metrics }
    }
}
