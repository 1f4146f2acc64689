use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dbagent_pipeline::{
    Error, Result,
    aggregator::{Aggregator, COLLECTION_BUFFER, STATUS_KEY},
    metric::{Collection, Metric},
    report::Report,
    spool::{MemorySpooler, Spooler},
    status::StatusTable,
    task::STATUS_CRASHED,
};
use dbagent_ticker::EvenTicker;
use tokio::sync::mpsc;

const T0: i64 = 1_700_000_040;

fn at(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Send a collection and wait until the aggregator has taken it.
async fn collect(tx: &mpsc::Sender<Collection>, collection: Collection) {
    tx.send(collection).await.unwrap();
    eventually("collection to be received", || {
        tx.capacity() == COLLECTION_BUFFER
    })
    .await;
}

async fn spooled_reports(spool: &MemorySpooler) -> Vec<Report> {
    let mut reports = Vec::new();
    for name in spool.files().await.unwrap() {
        let data = spool.read(&name).await.unwrap();
        reports.push(serde_json::from_slice(&data).unwrap());
    }
    reports
}

struct Harness {
    ticker: Arc<EvenTicker>,
    spool: Arc<MemorySpooler>,
    table: StatusTable,
    aggregator: Aggregator,
}

impl Harness {
    fn new() -> Self {
        let ticker = Arc::new(EvenTicker::new(Duration::from_secs(60)).unwrap());
        let spool = Arc::new(MemorySpooler::new());
        let table = StatusTable::new();
        let aggregator = Aggregator::new(ticker.clone(), spool.clone(), &table);
        Self {
            ticker,
            spool,
            table,
            aggregator,
        }
    }

    async fn tick(&self, ts: i64) {
        self.ticker.tick(at(ts));
        let table = self.table.clone();
        eventually("tick to be handled", move || {
            table.get(STATUS_KEY).as_deref() == Some("Aggregating")
        })
        .await;
    }
}

#[tokio::test]
async fn test_one_gauge_sample_per_window() {
    let h = Harness::new();
    let tx = h.aggregator.collector();
    h.aggregator.start().unwrap();

    // Collected before the first tick: discarded.
    collect(&tx, Collection::new(T0 - 10, vec![Metric::gauge("x", 99.0)])).await;

    h.tick(T0).await;
    collect(&tx, Collection::new(T0 + 5, vec![Metric::gauge("x", 10.0)])).await;
    h.ticker.tick(at(T0 + 60));

    let spool = h.spool.clone();
    eventually("report to be spooled", move || spool.len() == 1).await;

    let reports = spooled_reports(&h.spool).await;
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.ts, at(T0));
    let x = report.metrics["x"];
    assert_eq!(x.cnt, 1);
    assert_eq!(x.min, 10.0);
    assert_eq!(x.max, 10.0);
    assert_eq!(x.avg, 10.0);

    // Later samples belong to the next window.
    collect(&tx, Collection::new(T0 + 65, vec![Metric::gauge("x", 30.0)])).await;
    collect(&tx, Collection::new(T0 + 70, vec![Metric::gauge("y", 1.0)])).await;
    h.ticker.tick(at(T0 + 120));

    let spool = h.spool.clone();
    eventually("second report", move || spool.len() == 2).await;
    let reports = spooled_reports(&h.spool).await;
    assert_eq!(reports[1].ts, at(T0 + 60));
    assert_eq!(reports[1].metrics["x"].avg, 30.0);
    assert_eq!(reports[1].metrics["y"].cnt, 1);

    h.aggregator.stop().await;
}

#[tokio::test]
async fn test_value_lap_does_not_stop_aggregation() {
    let h = Harness::new();
    let tx = h.aggregator.collector();
    h.aggregator.start().unwrap();

    h.tick(T0).await;
    for (offset, value) in [(0, 100.0), (10, 0.0), (20, 150.0)] {
        collect(
            &tx,
            Collection::new(T0 + offset, vec![Metric::counter("q", value)]),
        )
        .await;
    }
    assert!(h.aggregator.is_running());

    h.ticker.tick(at(T0 + 60));
    let spool = h.spool.clone();
    eventually("report to be spooled", move || spool.len() == 1).await;

    let reports = spooled_reports(&h.spool).await;
    let q = reports[0].metrics["q"];
    assert_eq!(q.cnt, 1);
    assert_eq!(q.avg, 15.0);

    h.aggregator.stop().await;
}

#[tokio::test]
async fn test_start_stop_restart() {
    let h = Harness::new();
    h.aggregator.start().unwrap();
    assert!(h.aggregator.is_running());
    assert!(matches!(
        h.aggregator.start(),
        Err(Error::ServiceAlreadyRunning(_))
    ));

    h.aggregator.stop().await;
    assert!(!h.aggregator.is_running());
    assert_eq!(h.table.get(STATUS_KEY).as_deref(), Some("Stopped"));
    h.aggregator.stop().await;

    // The collection channel survives a restart.
    let tx = h.aggregator.collector();
    h.aggregator.start().unwrap();
    h.tick(T0).await;
    collect(&tx, Collection::new(T0 + 1, vec![Metric::gauge("z", 2.0)])).await;
    h.ticker.tick(at(T0 + 60));

    let spool = h.spool.clone();
    eventually("report after restart", move || spool.len() == 1).await;
    h.aggregator.stop().await;
    assert_eq!(h.aggregator.status()[STATUS_KEY], "Stopped");
}

#[tokio::test]
async fn test_empty_window_writes_nothing() {
    let h = Harness::new();
    h.aggregator.start().unwrap();

    h.tick(T0).await;
    h.ticker.tick(at(T0 + 60));
    h.ticker.tick(at(T0 + 120));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.spool.is_empty());
    h.aggregator.stop().await;
}

/// Panics on every write.
struct ExplodingSpooler;

#[async_trait]
impl Spooler for ExplodingSpooler {
    async fn write(&self, _report: &Report) -> Result<()> {
        panic!("spool write exploded")
    }

    async fn files(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        Err(Error::Spool(format!("no unit {name}")))
    }

    async fn remove(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_fault_in_aggregation_reports_crashed() {
    let ticker = Arc::new(EvenTicker::new(Duration::from_secs(60)).unwrap());
    let table = StatusTable::new();
    let aggregator = Aggregator::new(ticker.clone(), Arc::new(ExplodingSpooler), &table);
    let tx = aggregator.collector();
    aggregator.start().unwrap();

    ticker.tick(at(T0));
    let status = table.clone();
    eventually("first tick", move || {
        status.get(STATUS_KEY).as_deref() == Some("Aggregating")
    })
    .await;
    collect(&tx, Collection::new(T0 + 1, vec![Metric::gauge("x", 1.0)])).await;
    ticker.tick(at(T0 + 60));

    let status = table.clone();
    eventually("aggregator to crash", move || {
        status.get(STATUS_KEY).as_deref() == Some(STATUS_CRASHED)
    })
    .await;
    assert!(!aggregator.is_running());
    assert_eq!(aggregator.status()[STATUS_KEY], STATUS_CRASHED);

    // A crashed aggregator can be started again.
    aggregator.start().unwrap();
    assert!(aggregator.is_running());
    aggregator.stop().await;
}
