use crate::stats::Summary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated metrics for one window, as spooled and sent to the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Report {
    /// Start of the window.
    pub ts: DateTime<Utc>,
    pub metrics: BTreeMap<String, Summary>,
}

impl Report {
    pub fn new(ts: DateTime<Utc>, metrics: BTreeMap<String, Summary>) -> Self {
        Self { ts, metrics }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
