use crate::{Error, Result, metric::{Metric, MetricType}};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Finalized statistics for one metric over one window.
///
/// Location statistics are always observed values: percentiles are taken by
/// index into the sorted samples, never interpolated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Summary {
    pub cnt: usize,
    pub min: f64,
    pub pct5: f64,
    pub avg: f64,
    pub med: f64,
    pub pct95: f64,
    pub max: f64,
}

/// Per-metric accumulator for a single window.
///
/// Gauges accumulate raw values. Counters accumulate per-second rates
/// between consecutive samples, so the first counter sample only sets the
/// baseline and a decreasing value (e.g. `FLUSH STATUS`) restarts it.
#[derive(Debug, Clone)]
pub struct Stats {
    metric_type: MetricType,
    first_val: bool,
    prev_ts: i64,
    penu_ts: i64,
    prev_val: f64,
    penu_val: f64,
    vals: Vec<f64>,
    sum: f64,
    summary: Summary,
}

impl Stats {
    pub fn new(metric_type: MetricType) -> Self {
        Self {
            metric_type,
            first_val: true,
            prev_ts: 0,
            penu_ts: 0,
            prev_val: 0.0,
            penu_val: 0.0,
            vals: Vec::new(),
            sum: 0.0,
            summary: Summary::default(),
        }
    }

    /// Build an accumulator from a type name as found in monitor configs.
    pub fn from_type_name(metric_type: &str) -> Result<Self> {
        Ok(Self::new(metric_type.parse()?))
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// Number of samples accumulated so far.
    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    /// Drop accumulated samples, keeping the counter baseline.
    pub fn reset(&mut self) {
        self.vals.clear();
        self.sum = 0.0;
        self.summary = Summary::default();
    }

    /// Add a sample observed at unix time `ts` (seconds).
    ///
    /// A returned [`Error::ValueLap`] is a warning: the sample has been
    /// accounted for and aggregation can continue.
    pub fn add(&mut self, metric: &Metric, ts: i64) -> Result<()> {
        let value = metric.number;

        match self.metric_type {
            MetricType::Gauge => {
                self.vals.push(value);
                self.sum += value;
                Ok(())
            }
            MetricType::Counter => {
                if self.first_val {
                    self.first_val = false;
                    self.advance(ts, value);
                    return Ok(());
                }

                if value < self.prev_val {
                    // Counter reset; the next rate is computed from here.
                    self.advance(ts, value);
                    return Ok(());
                }

                let dur = ts - self.prev_ts;
                if dur <= 0 {
                    // No elapsed time, no rate. Keep the older baseline.
                    return Ok(());
                }

                // Value reset and then climbed past the pre-reset value
                // within one interval, or the reset sample was a blip.
                let lapped =
                    self.prev_val < self.penu_val && self.penu_val > 0.0 && value > self.penu_val;
                let lap = lapped.then(|| Error::ValueLap {
                    penultimate_ts: self.penu_ts,
                    penultimate: self.penu_val,
                    previous_ts: self.prev_ts,
                    previous: self.prev_val,
                    ts,
                    value,
                });

                let rate = (value - self.prev_val) / dur as f64;
                self.vals.push(rate);
                self.sum += rate;
                self.advance(ts, value);

                match lap {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    fn advance(&mut self, ts: i64, value: f64) {
        self.penu_ts = self.prev_ts;
        self.prev_ts = ts;
        self.penu_val = self.prev_val;
        self.prev_val = value;
    }

    /// Compute the summary over the accumulated samples.
    pub fn summarize(&mut self) -> Summary {
        let cnt = self.vals.len();
        if cnt == 0 {
            return self.summary;
        }

        self.vals
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        self.summary = Summary {
            cnt,
            min: self.vals[0],
            pct5: self.vals[(5 * cnt) / 100],
            avg: self.sum / cnt as f64,
            med: self.vals[(50 * cnt) / 100],
            pct95: self.vals[(95 * cnt) / 100],
            max: self.vals[cnt - 1],
        };
        self.summary
    }

    /// Last computed summary.
    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Summarize for reporting; `None` when the window saw no samples.
    pub fn finalize(&mut self) -> Option<Summary> {
        if self.vals.is_empty() {
            return None;
        }
        Some(self.summarize())
    }
}
