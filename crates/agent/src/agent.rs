//! Wiring of the agent's pipeline.

use crate::{
    Result,
    client::{ApiDialer, HttpTransport},
    monitor::SelfMonitor,
    service::{self, MetricsConfig, MetricsService},
    settings::Settings,
};
use dbagent_pipeline::{
    aggregator::Aggregator,
    sender::{self, Sender},
    service::{Cmd, Manager, Reply, Service},
    spool::DiskSpooler,
    status::{StatusMap, StatusTable},
};
use dbagent_ticker::EvenTicker;
use std::sync::Arc;
use tracing::info;

pub const MANAGER_NAME: &str = "agent";

/// Every component of a running agent.
pub struct Agent {
    settings: Settings,
    table: StatusTable,
    aggregator_ticker: Arc<EvenTicker>,
    sender_ticker: Arc<EvenTicker>,
    spool: Arc<DiskSpooler>,
    manager: Manager,
}

impl Agent {
    pub fn new(settings: Settings) -> Result<Self> {
        let table = StatusTable::new();
        let aggregator_ticker = Arc::new(EvenTicker::new(settings.aggregator_interval()?)?);
        let sender_ticker = Arc::new(EvenTicker::new(settings.sender_interval()?)?);
        let spool = Arc::new(DiskSpooler::new(settings.spool_dir(), settings.spool.max_files)?);

        let dialer = ApiDialer::new(
            &settings.api.url,
            &settings.api.ping_path,
            settings.api.api_key.clone(),
        )?;
        let transport = Arc::new(HttpTransport::new(dialer, settings.max_backoff(), &table));

        let aggregator = Arc::new(Aggregator::new(
            aggregator_ticker.clone(),
            spool.clone(),
            &table,
        ));
        let monitor = SelfMonitor::new(spool.clone(), aggregator.collector(), &table);
        let sender = Sender::new(transport, spool.clone(), sender_ticker.clone(), &table);

        let manager = Manager::new(MANAGER_NAME, &table);
        manager.register(Arc::new(MetricsService::new(aggregator, monitor)))?;
        manager.register(Arc::new(sender))?;

        Ok(Self {
            settings,
            table,
            aggregator_ticker,
            sender_ticker,
            spool,
            manager,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn spool(&self) -> &DiskSpooler {
        &self.spool
    }

    pub fn status_table(&self) -> &StatusTable {
        &self.table
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Per-service start configuration derived from the settings.
    pub fn service_configs(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let metrics = MetricsConfig {
            self_monitor: true,
            monitor_interval_secs: self.settings.monitor_interval()?.as_secs().max(1),
        };

        let mut configs = serde_json::Map::new();
        configs.insert(
            service::SERVICE_NAME.to_string(),
            serde_json::to_value(metrics)?,
        );
        configs.insert(
            sender::SERVICE_NAME.to_string(),
            serde_json::to_value(self.settings.sender_config())?,
        );
        Ok(configs)
    }

    /// Start the services, then the tickers that drive them.
    pub async fn start(&self) -> Result<()> {
        let configs = serde_json::to_vec(&self.service_configs()?)?;
        self.manager.start(&configs).await?;

        if let Err(err) = self.start_tickers().await {
            self.manager.stop().await?;
            return Err(err);
        }

        info!(
            spool = %self.spool.dir().display(),
            api = %self.settings.api.url,
            "agent started"
        );
        Ok(())
    }

    async fn start_tickers(&self) -> Result<()> {
        self.aggregator_ticker.start().await?;
        self.sender_ticker.start().await?;
        Ok(())
    }

    /// Stop the tickers, then the services in reverse start order.
    pub async fn stop(&self) -> Result<()> {
        self.aggregator_ticker.stop().await?;
        self.sender_ticker.stop().await?;
        self.manager.stop().await?;
        info!("agent stopped");
        Ok(())
    }

    pub async fn handle(&self, cmd: &Cmd) -> Reply {
        self.manager.handle(cmd).await
    }

    pub fn status(&self) -> StatusMap {
        self.manager.status()
    }
}
