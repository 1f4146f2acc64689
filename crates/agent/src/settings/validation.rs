use crate::settings::Settings;
use anyhow::{Context, Result, bail};
use dbagent_ticker::parse_interval;
use tracing_subscriber::EnvFilter;

/// Validate the configuration values
pub fn validate_config(settings: &Settings) -> Result<()> {
    if EnvFilter::try_new(&settings.log_level).is_err() {
        bail!("Invalid log level '{}'", settings.log_level);
    }

    if settings.base_dir.as_os_str().is_empty() {
        bail!("Base dir cannot be empty");
    }

    // Validate API settings
    if settings.api.url.is_empty() {
        bail!("API URL cannot be empty");
    }
    if !settings.api.url.starts_with("http://") && !settings.api.url.starts_with("https://") {
        bail!("API URL must start with http:// or https://");
    }
    url::Url::parse(&settings.api.url).context("Invalid API URL")?;
    if !settings.api.ping_path.starts_with('/') {
        bail!("API ping path must start with '/'");
    }
    if settings.api.connect_tries == 0 {
        bail!("API connect_tries must be greater than 0");
    }
    if settings.api.max_backoff_secs == 0 {
        bail!("API max_backoff_secs must be greater than 0");
    }

    // Validate intervals
    parse_interval(&settings.aggregator.interval).context("Invalid aggregator interval")?;
    parse_interval(&settings.sender.interval).context("Invalid sender interval")?;
    parse_interval(&settings.monitor.interval).context("Invalid monitor interval")?;

    // Validate sender settings
    if settings.sender.timeout_secs == 0 {
        bail!("Sender timeout_secs must be greater than 0");
    }
    if settings.sender.ack_timeout_secs == 0 {
        bail!("Sender ack_timeout_secs must be greater than 0");
    }

    if settings.spool.max_files == 0 {
        bail!("Spool max_files must be greater than 0");
    }

    Ok(())
}
