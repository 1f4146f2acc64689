//! Windowed aggregation of monitor samples into reports.
//!
//! Windows run from tick to tick. The first tick opens the first window;
//! anything collected before it is thrown away, so monitors and the
//! aggregator can be started in any order without waiting on each other.

use crate::{
    Error, Result,
    metric::Collection,
    report::Report,
    spool::Spooler,
    stats::Stats,
    status::{StatusHandle, StatusMap, StatusTable},
    task::SupervisedTask,
};
use chrono::{DateTime, Utc};
use dbagent_ticker::TickSource;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard,
    mpsc::{self, Receiver},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const STATUS_KEY: &str = "mm-aggregator";

/// Collections buffered between monitors and the aggregator.
pub const COLLECTION_BUFFER: usize = 100;

/// Samples of the window in progress.
#[derive(Debug, Default)]
struct Window {
    start: Option<DateTime<Utc>>,
    stats: BTreeMap<String, Stats>,
}

impl Window {
    fn add(&mut self, collection: &Collection) {
        for metric in &collection.metrics {
            let stats = self
                .stats
                .entry(metric.name.clone())
                .or_insert_with(|| Stats::new(metric.metric_type));

            if let Err(err) = stats.add(metric, collection.start_ts) {
                metrics::counter!("dbagent_aggregator_value_laps").increment(1);
                warn!(metric = %metric.name, %err, "counter sample");
            }
        }
    }

    /// Close the current window, if any, and open a new empty one at `now`.
    fn roll(&mut self, now: DateTime<Utc>) -> Option<Report> {
        let stats = std::mem::take(&mut self.stats);
        let report = self.start.map(|start| {
            let metrics = stats
                .into_iter()
                .filter_map(|(name, mut stats)| stats.finalize().map(|s| (name, s)))
                .collect();
            Report::new(start, metrics)
        });
        self.start = Some(now);

        report
    }
}

/// The single aggregation task for one tick source.
pub struct Aggregator {
    ticker: Arc<dyn TickSource>,
    spool: Arc<dyn Spooler>,
    status: StatusHandle,
    collector: mpsc::Sender<Collection>,
    collections: Arc<AsyncMutex<Receiver<Collection>>>,
    task: Mutex<Option<SupervisedTask>>,
}

impl Aggregator {
    pub fn new(ticker: Arc<dyn TickSource>, spool: Arc<dyn Spooler>, table: &StatusTable) -> Self {
        let (collector, collections) = mpsc::channel(COLLECTION_BUFFER);
        Self {
            ticker,
            spool,
            status: table.handle(STATUS_KEY),
            collector,
            collections: Arc::new(AsyncMutex::new(collections)),
            task: Mutex::new(None),
        }
    }

    /// Channel on which monitors deliver their collections.
    pub fn collector(&self) -> mpsc::Sender<Collection> {
        self.collector.clone()
    }

    pub fn start(&self) -> Result<()> {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(SupervisedTask::is_running) {
            return Err(Error::ServiceAlreadyRunning(STATUS_KEY.to_string()));
        }

        let ticks = self.ticker.subscribe();
        let collections = self.collections.clone();
        let spool = self.spool.clone();
        let status = self.status.clone();
        info!(interval = ?self.ticker.interval(), "starting aggregator");

        *task = Some(SupervisedTask::spawn(
            STATUS_KEY,
            self.status.clone(),
            move |cancel| async move {
                let collections = collections.lock_owned().await;
                run(ticks, collections, spool, status, cancel).await
            },
        ));
        Ok(())
    }

    /// Stop after the current iteration. The open window is discarded.
    pub async fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(SupervisedTask::is_running)
    }

    pub fn status(&self) -> StatusMap {
        self.status.map()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run(
    mut ticks: Receiver<DateTime<Utc>>,
    mut collections: OwnedMutexGuard<Receiver<Collection>>,
    spool: Arc<dyn Spooler>,
    status: StatusHandle,
    cancel: CancellationToken,
) -> Result<()> {
    status.update("Idle");
    let mut window = Window::default();
    let mut producers_open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            tick = ticks.recv() => {
                let Some(now) = tick else {
                    warn!("ticker went away, waiting for stop");
                    cancel.cancelled().await;
                    return Ok(());
                };
                if let Some(report) = window.roll(now) {
                    report_window(spool.as_ref(), &report).await;
                }
                status.update("Aggregating");
            }
            collection = collections.recv(), if producers_open => match collection {
                Some(collection) => window.add(&collection),
                None => producers_open = false,
            },
        }
    }
}

async fn report_window(spool: &dyn Spooler, report: &Report) {
    if report.is_empty() {
        debug!(ts = %report.ts, "nothing collected, skipping report");
        return;
    }

    match spool.write(report).await {
        Ok(()) => {
            metrics::counter!("dbagent_aggregator_reports").increment(1);
            debug!(ts = %report.ts, metrics = report.metrics.len(), "report spooled");
        }
        Err(err) => error!(ts = %report.ts, %err, "cannot spool report"),
    }
}
