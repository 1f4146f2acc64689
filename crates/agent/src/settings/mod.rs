pub mod validation;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config as ConfigBuilder, Environment, File};
use dbagent_pipeline::sender::{ACK_TIMEOUT_SECS, CONNECT_TRIES, SenderConfig};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};
use validation::validate_config;

const ENV_PREFIX: &str = "DBAGENT";

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct AppArgs {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Drop spooled reports instead of sending them
    #[arg(long)]
    pub blackhole: bool,
}

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log filter directive (e.g. "info", "debug", "dbagent_pipeline=trace")
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding the agent's spool
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Prometheus exporter listen address
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
    pub api: ApiSettings,
    #[serde(default)]
    pub aggregator: AggregatorSettings,
    #[serde(default)]
    pub sender: SenderSettings,
    #[serde(default)]
    pub spool: SpoolSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

/// Remote collection API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Endpoint spooled reports are POSTed to
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    /// Path probed with a GET before sending
    #[serde(default = "default_ping_path")]
    pub ping_path: String,
    /// Connection attempts per send attempt
    #[serde(default = "default_connect_tries")]
    pub connect_tries: u32,
    /// Upper bound of the delay between connection attempts
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// Window length, e.g. "1m"
    pub interval: String,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            interval: "1m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    /// Time between send cycles, e.g. "1m"
    pub interval: String,
    /// Budget of one send cycle
    pub timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub blackhole: bool,
}

impl Default for SenderSettings {
    fn default() -> Self {
        let defaults = SenderConfig::default();
        Self {
            interval: "1m".to_string(),
            timeout_secs: defaults.timeout_secs,
            ack_timeout_secs: ACK_TIMEOUT_SECS,
            blackhole: defaults.blackhole,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolSettings {
    /// Reports kept before the oldest is dropped
    pub max_files: usize,
}

impl Default for SpoolSettings {
    fn default() -> Self {
        Self { max_files: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Sampling interval of the agent's self monitor, e.g. "10s"
    pub interval: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/dbagent")
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9191))
}

fn default_ping_path() -> String {
    "/ping".to_string()
}

fn default_connect_tries() -> u32 {
    CONNECT_TRIES
}

fn default_max_backoff_secs() -> u64 {
    20
}

impl Settings {
    /// Load from `config` if given, otherwise from the environment only.
    pub fn new(config: Option<&Path>) -> Result<Self> {
        match config {
            Some(path) => Self::from_path(path),
            None => Self::from_env(),
        }
    }

    /// Load configuration from a specific config file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Env vars take priority over the file
        let settings = ConfigBuilder::builder()
            .add_source(File::with_name(&path.as_ref().to_string_lossy()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        validate_config(&settings)?;

        Ok(settings)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // NOTE: It's ok if this fails (file might not exist)
        let _ = dotenvy::dotenv();

        let settings: Settings = ConfigBuilder::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        validate_config(&settings)?;

        Ok(settings)
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.base_dir.join("spool")
    }

    pub fn aggregator_interval(&self) -> dbagent_ticker::Result<Duration> {
        dbagent_ticker::parse_interval(&self.aggregator.interval)
    }

    pub fn sender_interval(&self) -> dbagent_ticker::Result<Duration> {
        dbagent_ticker::parse_interval(&self.sender.interval)
    }

    pub fn monitor_interval(&self) -> dbagent_ticker::Result<Duration> {
        dbagent_ticker::parse_interval(&self.monitor.interval)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.api.max_backoff_secs)
    }

    /// Runtime configuration of the `data` service.
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            timeout_secs: self.sender.timeout_secs,
            blackhole: self.sender.blackhole,
            connect_tries: self.api.connect_tries,
            ack_timeout_secs: self.sender.ack_timeout_secs,
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings {{\n\
             \tLog level: {}\n\
             \tBase dir: {}\n\
             \tMetrics addr: {}\n\
             \tAPI: {} (key {})\n\
             \tAggregator interval: {}\n\
             \tSender: every {}, timeout {}s, blackhole {}\n\
             \tSpool max files: {}\n\
             \tMonitor interval: {}\n\
             }}",
            self.log_level,
            self.base_dir.display(),
            self.metrics_addr,
            self.api.url,
            if self.api.api_key.is_empty() { "unset" } else { "set" },
            self.aggregator.interval,
            self.sender.interval,
            self.sender.timeout_secs,
            self.sender.blackhole,
            self.spool.max_files,
            self.monitor.interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_takes_defaults() {
        let file = write_config(
            r#"
            [api]
            url = "https://api.example.com/v1/data"
            "#,
        );

        let settings = Settings::from_path(file.path()).unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.api.ping_path, "/ping");
        assert_eq!(settings.api.connect_tries, 10);
        assert_eq!(settings.aggregator_interval().unwrap(), Duration::from_secs(60));
        assert_eq!(settings.monitor_interval().unwrap(), Duration::from_secs(10));
        assert_eq!(settings.spool.max_files, 1000);
        assert_eq!(settings.spool_dir(), PathBuf::from("/var/lib/dbagent/spool"));

        let sender = settings.sender_config();
        assert_eq!(sender.timeout_secs, 60);
        assert_eq!(sender.ack_timeout_secs, 5);
        assert!(!sender.blackhole);
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
            log_level = "debug"
            base_dir = "/tmp/dbagent-test"
            metrics_addr = "0.0.0.0:9000"

            [api]
            url = "http://localhost:8080/data"
            api_key = "s3cret"
            connect_tries = 3
            max_backoff_secs = 5

            [aggregator]
            interval = "5m"

            [sender]
            interval = "30s"
            timeout_secs = 20
            ack_timeout_secs = 2
            blackhole = true

            [spool]
            max_files = 10
            "#,
        );

        let settings = Settings::from_path(file.path()).unwrap();
        assert_eq!(settings.metrics_addr.port(), 9000);
        assert_eq!(settings.aggregator_interval().unwrap(), Duration::from_secs(300));
        assert_eq!(settings.sender_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(settings.max_backoff(), Duration::from_secs(5));
        assert_eq!(
            settings.sender_config(),
            SenderConfig {
                timeout_secs: 20,
                blackhole: true,
                connect_tries: 3,
                ack_timeout_secs: 2,
            }
        );
        assert!(settings.to_string().contains("key set"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let file = write_config(
            r#"
            [api]
            url = "ftp://example.com"
            "#,
        );
        let err = Settings::from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("http"), "{err}");
    }
}
