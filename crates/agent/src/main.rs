use anyhow::Context;
use clap::Parser;
use dbagent::{
    Agent,
    settings::{AppArgs, Settings},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AppArgs::parse();
    let mut settings = Settings::new(args.config.as_deref())?;
    if args.blackhole {
        settings.sender.blackhole = true;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&settings.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    PrometheusBuilder::new()
        .with_http_listener(settings.metrics_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    export_build_info();

    info!(%settings, "dbagent starting");

    let shutdown_listener = shutdown_listener();

    let agent = Agent::new(settings).context("Failed to build agent")?;
    agent.start().await.context("Failed to start agent")?;

    shutdown_listener.cancelled().await;
    info!("shutdown signal received");

    if let Err(err) = agent.stop().await {
        error!(?err, "agent did not stop cleanly");
    }

    let mut status: Vec<_> = agent.status().into_iter().collect();
    status.sort();
    for (key, value) in status {
        info!(%key, %value, "final status");
    }

    info!("dbagent shutting down");

    Ok(())
}

fn shutdown_listener() -> CancellationToken {
    let cancellation_token = CancellationToken::new();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("sigterm listener failed");
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => cancellation_token.cancel(),
                _ = signal::ctrl_c() => cancellation_token.cancel(),
            }
        }
    });

    cancellation_token
}

fn export_build_info() {
    let version = option_env!("BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    let build_commit = option_env!("BUILD_COMMIT").unwrap_or("UNKNOWN");
    let build_date = option_env!("DATE").unwrap_or("UNKNOWN");
    let pkg_version = env!("CARGO_PKG_VERSION");

    metrics::gauge!(
        "dbagent_build_info",
        "version" => version,
        "commit" => build_commit,
        "date" => build_date,
        "pkg_version" => pkg_version
    )
    .set(1);
}
