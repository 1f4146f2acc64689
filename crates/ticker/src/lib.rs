//! Wall-clock aligned tick sources.
//!
//! Aggregation windows and send cycles are delimited by ticks that land on
//! even multiples of an interval counted from the Unix epoch, e.g. with a one
//! minute interval every tick is at `hh:mm:00`. Consumers subscribe to a
//! [`TickSource`] and receive the aligned timestamp of each tick.
//!
//! # Example
//!
//! ```no_run
//! use dbagent_ticker::{EvenTicker, TickSource, parse_interval};
//!
//! # async fn run() -> dbagent_ticker::Result<()> {
//! let ticker = EvenTicker::new(parse_interval("1m")?)?;
//! let mut ticks = ticker.subscribe();
//! ticker.start().await?;
//!
//! while let Some(ts) = ticks.recv().await {
//!     println!("window boundary at {ts}");
//! }
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, info, warn};

/// Ticks buffered per subscriber before further ticks are dropped.
const SUBSCRIBER_BUFFER: usize = 4;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid interval '{0}': {1}")]
    InvalidInterval(String, String),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

/// Anything that hands out streams of aligned tick timestamps.
pub trait TickSource: Send + Sync {
    /// Period between two ticks.
    fn interval(&self) -> Duration;

    /// Register a new subscriber. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> Receiver<DateTime<Utc>>;
}

/// Ticker firing on even multiples of its interval.
pub struct EvenTicker {
    interval: Duration,
    subscribers: Arc<Mutex<Vec<Sender<DateTime<Utc>>>>>,
    scheduler: tokio::sync::Mutex<Option<JobScheduler>>,
}

impl EvenTicker {
    pub fn new(interval: Duration) -> Result<Self> {
        // Validates the interval up front so start() cannot fail on it.
        interval_to_cron(interval)?;
        Ok(Self {
            interval,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            scheduler: tokio::sync::Mutex::new(None),
        })
    }

    /// Start firing ticks. Calling start on a running ticker is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return Ok(());
        }

        let cron_expr = interval_to_cron(self.interval)?;
        let subscribers = self.subscribers.clone();
        let interval = self.interval;
        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _l| {
            let subscribers = subscribers.clone();
            Box::pin(async move {
                broadcast(&subscribers, sync(Utc::now(), interval));
            })
        })?;

        let sched = JobScheduler::new().await?;
        sched.add(job).await?;
        sched.start().await?;

        info!(interval = ?self.interval, cron = %cron_expr, "ticker started");
        *scheduler = Some(sched);
        Ok(())
    }

    /// Stop firing ticks. Subscribers stay registered for a later start.
    pub async fn stop(&self) -> Result<()> {
        if let Some(mut sched) = self.scheduler.lock().await.take() {
            sched.shutdown().await?;
            info!(interval = ?self.interval, "ticker stopped");
        }
        Ok(())
    }

    /// Deliver a tick to every subscriber right now.
    pub fn tick(&self, now: DateTime<Utc>) {
        broadcast(&self.subscribers, now);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl TickSource for EvenTicker {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn subscribe(&self) -> Receiver<DateTime<Utc>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        lock(&self.subscribers).push(tx);
        rx
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn broadcast(subscribers: &Mutex<Vec<Sender<DateTime<Utc>>>>, ts: DateTime<Utc>) {
    let mut subscribers = lock(subscribers);
    subscribers.retain(|tx| match tx.try_send(ts) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(%ts, "tick subscriber is lagging; tick dropped");
            true
        }
        Err(TrySendError::Closed(_)) => {
            debug!(%ts, "tick subscriber went away");
            false
        }
    });
}

/// Round `now` down to the previous multiple of `interval` since the epoch.
pub fn sync(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = interval.as_secs() as i64;
    if secs == 0 {
        return now;
    }
    let ts = now.timestamp();
    Utc.timestamp_opt(ts - ts.rem_euclid(secs), 0)
        .single()
        .unwrap_or(now)
}

/// Parse an interval string.
///
/// Supports formats like "5s", "10m", "2h" or plain numbers (treated as seconds).
/// Maximum allowed duration is less than 24 hours, and the interval must
/// evenly divide a minute, an hour or a day so ticks stay evenly spaced.
pub fn parse_interval(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let invalid = |reason: &str| Error::InvalidInterval(s.clone(), reason.to_string());

    let (num_str, multiplier) = if let Some(num_str) = s.strip_suffix('s') {
        (num_str, 1)
    } else if let Some(num_str) = s.strip_suffix('m') {
        (num_str, 60)
    } else if let Some(num_str) = s.strip_suffix('h') {
        (num_str, 3600)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| invalid("not a number"))?;
    let secs = num.checked_mul(multiplier).ok_or_else(|| invalid("too large"))?;

    if secs == 0 {
        return Err(invalid("must be greater than zero"));
    }
    if secs >= DAY {
        return Err(invalid("maximum allowed is less than 24 hours"));
    }
    check_even(secs).map_err(invalid)?;

    Ok(Duration::from_secs(secs))
}

const MINUTE: u64 = 60;
const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Ticks stay evenly spaced only if the interval divides the next larger
/// unit: seconds divide a minute, minutes an hour, hours a day.
fn check_even(secs: u64) -> std::result::Result<(), &'static str> {
    let even = if secs < MINUTE {
        MINUTE % secs == 0
    } else if secs < HOUR {
        secs % MINUTE == 0 && HOUR % secs == 0
    } else {
        secs % HOUR == 0 && DAY % secs == 0
    };

    if even {
        Ok(())
    } else {
        Err("must evenly divide a minute, an hour or a day")
    }
}

/// Convert an interval to a cron expression with a seconds field.
fn interval_to_cron(interval: Duration) -> Result<String> {
    let secs = interval.as_secs();
    let invalid =
        |reason: &str| Error::InvalidInterval(format!("{interval:?}"), reason.to_string());
    if secs == 0 || secs >= DAY || interval.subsec_nanos() != 0 {
        return Err(invalid("must be whole seconds between 1s and 24h"));
    }
    check_even(secs).map_err(invalid)?;

    if secs < MINUTE {
        Ok(format!("*/{} * * * * *", secs))
    } else if secs < HOUR {
        Ok(format!("0 */{} * * * *", secs / MINUTE))
    } else {
        Ok(format!("0 0 */{} * * *", secs / HOUR))
    }
}
