//! The agent's own monitor.
//!
//! Samples the spool on a fixed interval and feeds the samples to the
//! aggregator like any other monitor would.

use chrono::Utc;
use dbagent_pipeline::{
    Error, Result,
    metric::{Collection, Metric},
    spool::DiskSpooler,
    status::{StatusHandle, StatusMap, StatusTable},
    task::SupervisedTask,
};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const STATUS_KEY: &str = "mm-monitor";

pub const SPOOL_FILES: &str = "agent/spool_files";
pub const SPOOL_BYTES: &str = "agent/spool_bytes";
pub const REPORTS_SPOOLED: &str = "agent/reports_spooled";

pub struct SelfMonitor {
    spool: Arc<DiskSpooler>,
    collector: mpsc::Sender<Collection>,
    status: StatusHandle,
    task: Mutex<Option<SupervisedTask>>,
}

impl SelfMonitor {
    pub fn new(
        spool: Arc<DiskSpooler>,
        collector: mpsc::Sender<Collection>,
        table: &StatusTable,
    ) -> Self {
        Self {
            spool,
            collector,
            status: table.handle(STATUS_KEY),
            task: Mutex::new(None),
        }
    }

    /// Take one sample now.
    pub async fn sample(&self) -> Result<Collection> {
        sample(&self.spool).await
    }

    pub fn start(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidConfig("monitor interval must be > 0".into()));
        }

        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(SupervisedTask::is_running) {
            return Err(Error::ServiceAlreadyRunning(STATUS_KEY.to_string()));
        }

        info!(?interval, "starting self monitor");
        let spool = self.spool.clone();
        let collector = self.collector.clone();
        let status = self.status.clone();
        *task = Some(SupervisedTask::spawn(
            STATUS_KEY,
            self.status.clone(),
            move |cancel| run(spool, collector, status, interval, cancel),
        ));
        Ok(())
    }

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

async fn sample(spool: &DiskSpooler) -> Result<Collection> {
    let start_ts = Utc::now().timestamp();
    let usage = spool.usage().await?;
    Ok(Collection::new(
        start_ts,
        vec![
            Metric::gauge(SPOOL_FILES, usage.files as f64),
            Metric::gauge(SPOOL_BYTES, usage.bytes as f64),
            Metric::counter(REPORTS_SPOOLED, spool.reports_written() as f64),
        ],
    ))
}

async fn run(
    spool: Arc<DiskSpooler>,
    collector: mpsc::Sender<Collection>,
    status: StatusHandle,
    period: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    status.update("Idle");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = interval.tick() => {
                status.update("Collecting");
                let collection = match sample(&spool).await {
                    Ok(collection) => collection,
                    Err(err) => {
                        warn!(%err, "failed to sample spool");
                        status.update("Idle");
                        continue;
                    }
                };

                match collector.try_send(collection) {
                    Ok(()) => debug!("spool sample collected"),
                    Err(TrySendError::Full(_)) => warn!("aggregator is behind, sample dropped"),
                    Err(TrySendError::Closed(_)) => {
                        warn!("aggregator went away, waiting for stop");
                        status.update("Idle");
                        cancel.cancelled().await;
                        return Ok(());
                    }
                }
                status.update("Idle");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbagent_pipeline::{report::Report, spool::Spooler};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_sample_reports_spool_usage() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(DiskSpooler::new(dir.path(), 10).unwrap());
        spool
            .write(&Report::new(Utc::now(), BTreeMap::new()))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let monitor = SelfMonitor::new(spool, tx, &StatusTable::new());
        let collection = monitor.sample().await.unwrap();

        let by_name: BTreeMap<_, _> = collection
            .metrics
            .iter()
            .map(|m| (m.name.as_str(), m.number))
            .collect();
        assert_eq!(by_name[SPOOL_FILES], 1.0);
        assert!(by_name[SPOOL_BYTES] > 0.0);
        assert_eq!(by_name[REPORTS_SPOOLED], 1.0);
    }

    #[tokio::test]
    async fn test_samples_on_interval_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(DiskSpooler::new(dir.path(), 10).unwrap());
        let table = StatusTable::new();
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = SelfMonitor::new(spool, tx, &table);

        monitor.start(Duration::from_millis(20)).unwrap();
        assert!(matches!(
            monitor.start(Duration::from_millis(20)),
            Err(Error::ServiceAlreadyRunning(_))
        ));

        // First sample is taken immediately, the next one after the interval.
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.metrics.len(), 3);
        assert_eq!(second.metrics[0].name, SPOOL_FILES);

        monitor.stop().await;
        assert!(!monitor.is_running());
        assert_eq!(table.get(STATUS_KEY).as_deref(), Some("Stopped"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(DiskSpooler::new(dir.path(), 10).unwrap());
        let (tx, _rx) = mpsc::channel(1);
        let monitor = SelfMonitor::new(spool, tx, &StatusTable::new());
        assert!(matches!(
            monitor.start(Duration::ZERO),
            Err(Error::InvalidConfig(_))
        ));
    }
}
