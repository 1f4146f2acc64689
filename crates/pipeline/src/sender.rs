//! Spool-and-send delivery.
//!
//! On every tick the [`Sender`] runs one send cycle: connect to the API,
//! send every pending spool unit in order, and remove each unit once the API
//! has acknowledged it. A cycle is bounded by a time budget and by
//! [`MAX_SEND_ERRORS`] transport errors; anything not acknowledged stays in
//! the spool for the next cycle, so delivery is at-least-once.

use crate::{
    Error, Result,
    service::{Cmd, Reply, Service, ServiceCommand, parse_config},
    spool::Spooler,
    status::{StatusHandle, StatusMap, StatusTable},
    task::SupervisedTask,
    transport::Transport,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dbagent_ticker::TickSource;
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::mpsc::Receiver, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SERVICE_NAME: &str = "data";
pub const STATUS_KEY: &str = "data-sender";

/// Transport errors tolerated per send cycle.
pub const MAX_SEND_ERRORS: u32 = 3;
/// Pause before reconnecting after an error.
pub const CONNECT_ERROR_WAIT: Duration = Duration::from_secs(3);
pub const CONNECT_TRIES: u32 = 10;
pub const ACK_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Budget for one send cycle.
    pub timeout_secs: u64,
    /// Remove units without sending them.
    pub blackhole: bool,
    pub connect_tries: u32,
    /// How long to wait for the API to acknowledge a unit.
    pub ack_timeout_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            blackhole: false,
            connect_tries: CONNECT_TRIES,
            ack_timeout_secs: ACK_TIMEOUT_SECS,
        }
    }
}

impl SenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Outcome of one send cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendSummary {
    /// Units acknowledged by the API, including rejected ones.
    pub sent: u64,
    pub bytes: u64,
    /// Time spent in `send_bytes`.
    pub send_time: Duration,
    pub errors: u32,
    /// Units the API rejected with a 4xx.
    pub bad: u64,
    /// The API answered with a 5xx; remaining units were kept.
    pub api_error: bool,
    pub timeout: bool,
}

impl SendSummary {
    pub fn has_issues(&self) -> bool {
        self.errors > 0 || self.bad > 0 || self.api_error || self.timeout
    }

    /// One-line description for logs and status.
    pub fn info(&self, at: DateTime<Utc>) -> String {
        let secs = self.send_time.as_secs_f64();
        let mut info = format!(
            "last sent at {}: {} ok, {:.2}s, {} Mbps",
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.sent,
            secs,
            mbps(self.bytes, secs),
        );
        if self.has_issues() {
            info.push_str(&format!(
                ", {} bad, {} error, API error {}, timeout {}",
                self.bad, self.errors, self.api_error, self.timeout
            ));
        }
        info
    }
}

/// Throughput in megabits per second with two decimals.
pub fn mbps(bytes: u64, secs: f64) -> String {
    if secs <= 0.0 {
        return "0.00".to_string();
    }
    format!("{:.2}", (bytes as f64 * 8.0) / 1_000_000.0 / secs)
}

/// State for running send cycles, shared by [`Sender::send`] and the
/// background loop.
#[derive(Clone)]
struct Cycle {
    transport: Arc<dyn Transport>,
    spool: Arc<dyn Spooler>,
    status: StatusHandle,
    config: SenderConfig,
}

impl Cycle {
    async fn send(&self) -> SendSummary {
        debug!("send:call");

        let mut summary = SendSummary::default();
        let timeout = self.config.timeout();
        let start = Instant::now();

        while !summary.api_error && !summary.timeout && summary.errors < MAX_SEND_ERRORS {
            let elapsed = start.elapsed();
            if elapsed > timeout {
                summary.timeout = true;
                warn!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    timeout_secs = self.config.timeout_secs,
                    "timeout sending data"
                );
                break;
            }

            self.status.update("Connecting");
            debug!("send:connecting");
            if summary.errors > 0 {
                tokio::time::sleep(CONNECT_ERROR_WAIT).await;
            }
            if let Err(err) = self.transport.connect_once(self.config.connect_tries).await {
                summary.errors += 1;
                metrics::counter!("dbagent_sender_errors").increment(1);
                warn!(%err, "cannot connect to API");
                continue;
            }
            debug!("send:connected");

            match self.send_all_files(start, &mut summary).await {
                // Done, or the API asked us to come back later.
                Ok(()) => break,
                Err(err) => {
                    summary.errors += 1;
                    metrics::counter!("dbagent_sender_errors").increment(1);
                    warn!(%err, errors = summary.errors, "error sending data, reconnecting");
                    self.transport.disconnect_once().await;
                }
            }
        }

        self.status.update("Disconnecting");
        self.transport.disconnect_once().await;

        let info = summary.info(Utc::now());
        self.status.update(format!("Idle ({info})"));
        info!("{info}");
        if summary.sent == 0 && !summary.api_error {
            warn!("no data sent");
        }

        debug!("send:return");
        summary
    }

    async fn send_all_files(&self, start: Instant, summary: &mut SendSummary) -> Result<()> {
        self.status.update("Running");
        let timeout = self.config.timeout();

        for file in self.spool.files().await? {
            debug!(%file, "send:file");

            let elapsed = start.elapsed();
            if elapsed > timeout {
                summary.timeout = true;
                warn!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    timeout_secs = self.config.timeout_secs,
                    "timeout sending data"
                );
                return Ok(());
            }

            self.status.update(format!("Reading {file}"));
            let data = self.spool.read(&file).await?;

            if data.is_empty() {
                self.remove(&file).await;
                warn!(%file, "removed empty spool file");
                continue;
            }

            if self.config.blackhole {
                self.status.update(format!("Removing {file} (blackhole)"));
                self.remove(&file).await;
                info!(%file, "removed (blackhole)");
                continue;
            }

            self.status.update(format!("Sending {file}"));
            let t0 = Instant::now();
            self.transport
                .send_bytes(&data, timeout.saturating_sub(elapsed))
                .await
                .inspect_err(|err| warn!(%file, %err, "sending failed"))?;
            summary.send_time += t0.elapsed();
            summary.bytes += data.len() as u64;
            metrics::counter!("dbagent_sender_bytes_sent").increment(data.len() as u64);

            self.status.update(format!("Waiting for API to ack {file}"));
            let resp = self
                .transport
                .recv(self.config.ack_timeout())
                .await
                .inspect_err(|err| warn!(%file, %err, "waiting for API to ack failed"))?;
            debug!(%file, code = resp.code, "send:resp");

            match resp.code {
                // API trouble; keep the unit and try again next cycle.
                500.. => {
                    summary.api_error = true;
                    return Ok(());
                }
                400..=499 => {
                    self.status.update(format!("Removing {file}"));
                    self.remove(&file).await;
                    warn!(%file, code = resp.code, error = %resp.error, "removed file rejected by API");
                    summary.sent += 1;
                    summary.bad += 1;
                    metrics::counter!("dbagent_sender_files_sent").increment(1);
                    metrics::counter!("dbagent_sender_files_bad").increment(1);
                }
                300..=399 => {
                    return Err(Error::UnhandledResponse {
                        code: resp.code,
                        error: resp.error,
                    });
                }
                200..=299 => {
                    self.status.update(format!("Removing {file}"));
                    self.remove(&file).await;
                    summary.sent += 1;
                    metrics::counter!("dbagent_sender_files_sent").increment(1);
                }
                _ => {
                    return Err(Error::UnknownResponse {
                        code: resp.code,
                        error: resp.error,
                    });
                }
            }
        }

        Ok(())
    }

    /// A unit that cannot be removed is sent again next cycle.
    async fn remove(&self, file: &str) {
        if let Err(err) = self.spool.remove(file).await {
            warn!(%file, %err, "cannot remove spool file");
        }
    }
}

async fn run(
    cycle: Cycle,
    mut ticks: Receiver<DateTime<Utc>>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("sender running");
    cycle.status.update("Idle");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            tick = ticks.recv() => match tick {
                Some(ts) => {
                    debug!(%ts, "send tick");
                    cycle.send().await;
                }
                None => {
                    warn!("ticker went away, waiting for stop");
                    cancel.cancelled().await;
                    return Ok(());
                }
            },
        }
    }
}

/// The `data` service.
pub struct Sender {
    transport: Arc<dyn Transport>,
    spool: Arc<dyn Spooler>,
    ticker: Arc<dyn TickSource>,
    status: StatusHandle,
    config: Mutex<SenderConfig>,
    task: Mutex<Option<SupervisedTask>>,
}

impl Sender {
    pub fn new(
        transport: Arc<dyn Transport>,
        spool: Arc<dyn Spooler>,
        ticker: Arc<dyn TickSource>,
        table: &StatusTable,
    ) -> Self {
        Self {
            transport,
            spool,
            ticker,
            status: table.handle(STATUS_KEY),
            config: Mutex::new(SenderConfig::default()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SenderConfig {
        lock(&self.config).clone()
    }

    pub fn set_config(&self, config: SenderConfig) {
        *lock(&self.config) = config;
    }

    /// Run one send cycle now with the current configuration.
    pub async fn send(&self) -> SendSummary {
        self.cycle().send().await
    }

    fn cycle(&self) -> Cycle {
        Cycle {
            transport: self.transport.clone(),
            spool: self.spool.clone(),
            status: self.status.clone(),
            config: self.config(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Service for Sender {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self, config: &[u8]) -> Result<()> {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(SupervisedTask::is_running) {
            return Err(Error::ServiceAlreadyRunning(SERVICE_NAME.to_string()));
        }

        let config: SenderConfig = parse_config(config)?;
        if config.timeout_secs == 0 {
            return Err(Error::InvalidConfig("sender timeout must be > 0".into()));
        }
        info!(
            timeout_secs = config.timeout_secs,
            blackhole = config.blackhole,
            interval = ?self.ticker.interval(),
            "starting sender"
        );
        self.set_config(config);

        let cycle = self.cycle();
        let ticks = self.ticker.subscribe();
        *task = Some(SupervisedTask::spawn(
            STATUS_KEY,
            self.status.clone(),
            move |cancel| run(cycle, ticks, cancel),
        ));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.stop().await;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(SupervisedTask::is_running)
    }

    fn status(&self) -> StatusMap {
        let mut status = self.status.map();
        status.extend(self.transport.status());
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
