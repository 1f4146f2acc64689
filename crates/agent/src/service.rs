//! The `mm` service: the aggregator plus the agent's own monitor.

use crate::monitor::SelfMonitor;
use async_trait::async_trait;
use dbagent_pipeline::{
    Error, Result,
    aggregator::Aggregator,
    service::{Cmd, Reply, Service, ServiceCommand, parse_config},
    status::StatusMap,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::info;

pub const SERVICE_NAME: &str = "mm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Run the spool self monitor alongside the aggregator.
    pub self_monitor: bool,
    pub monitor_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            self_monitor: true,
            monitor_interval_secs: 10,
        }
    }
}

pub struct MetricsService {
    aggregator: Arc<Aggregator>,
    monitor: SelfMonitor,
    config: Mutex<MetricsConfig>,
}

impl MetricsService {
    pub fn new(aggregator: Arc<Aggregator>, monitor: SelfMonitor) -> Self {
        Self {
            aggregator,
            monitor,
            config: Mutex::new(MetricsConfig::default()),
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn monitor(&self) -> &SelfMonitor {
        &self.monitor
    }

    pub fn config(&self) -> MetricsConfig {
        lock(&self.config).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Service for MetricsService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self, config: &[u8]) -> Result<()> {
        if self.aggregator.is_running() {
            return Err(Error::ServiceAlreadyRunning(SERVICE_NAME.to_string()));
        }

        let config: MetricsConfig = parse_config(config)?;
        if config.self_monitor && config.monitor_interval_secs == 0 {
            return Err(Error::InvalidConfig("monitor interval must be > 0".into()));
        }

        self.aggregator.start()?;
        if config.self_monitor {
            let interval = Duration::from_secs(config.monitor_interval_secs);
            if let Err(err) = self.monitor.start(interval) {
                self.aggregator.stop().await;
                return Err(err);
            }
        }

        info!(self_monitor = config.self_monitor, "metrics service started");
        *lock(&self.config) = config;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Monitors first so nothing is sent into a stopped aggregator.
        self.monitor.stop().await;
        self.aggregator.stop().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.aggregator.is_running()
    }

    fn status(&self) -> StatusMap {
        let mut status = self.aggregator.status();
        status.extend(self.monitor.status());
        status
    }

    async fn handle(&self, cmd: &Cmd) -> Reply {
        match cmd.cmd.parse::<ServiceCommand>() {
            Ok(ServiceCommand::GetConfig) => Reply::json(cmd, &self.config()),
            Ok(ServiceCommand::Status) => Reply::json(cmd, &self.status()),
            Err(_) => Reply::unknown(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbagent_pipeline::{spool::DiskSpooler, status::StatusTable};
    use dbagent_ticker::EvenTicker;

    fn service(table: &StatusTable, dir: &std::path::Path) -> MetricsService {
        let ticker = Arc::new(EvenTicker::new(Duration::from_secs(60)).unwrap());
        let spool = Arc::new(DiskSpooler::new(dir, 10).unwrap());
        let aggregator = Arc::new(Aggregator::new(ticker, spool.clone(), table));
        let monitor = SelfMonitor::new(spool, aggregator.collector(), table);
        MetricsService::new(aggregator, monitor)
    }

    #[tokio::test]
    async fn test_lifecycle_and_commands() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::new();
        let mm = service(&table, dir.path());

        mm.start(br#"{"monitor_interval_secs":5}"#).await.unwrap();
        assert!(mm.is_running());
        assert!(mm.monitor().is_running());
        assert!(matches!(
            mm.start(b"").await,
            Err(Error::ServiceAlreadyRunning(_))
        ));

        let reply = mm.handle(&Cmd::new(SERVICE_NAME, "GetConfig")).await;
        let config: MetricsConfig = serde_json::from_slice(&reply.data).unwrap();
        assert_eq!(config.monitor_interval_secs, 5);
        assert!(config.self_monitor);

        let status = mm.status();
        assert!(status.contains_key("mm-aggregator"));
        assert!(status.contains_key("mm-monitor"));

        let reply = mm.handle(&Cmd::new(SERVICE_NAME, "StartTool")).await;
        assert_eq!(reply.error, "Unknown command: StartTool");

        mm.stop().await.unwrap();
        assert!(!mm.is_running());
        assert!(!mm.monitor().is_running());
    }

    #[tokio::test]
    async fn test_without_self_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::new();
        let mm = service(&table, dir.path());

        mm.start(br#"{"self_monitor":false,"monitor_interval_secs":0}"#)
            .await
            .unwrap();
        assert!(mm.is_running());
        assert!(!mm.monitor().is_running());
        mm.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mm = service(&StatusTable::new(), dir.path());
        assert!(matches!(
            mm.start(br#"{"monitor_interval_secs":0}"#).await,
            Err(Error::InvalidConfig(_))
        ));
        assert!(!mm.is_running());
    }
}
