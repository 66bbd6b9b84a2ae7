mod cli;
mod config;
mod cycle;
mod normalize;
mod sensors;
mod service;
mod sink;
#[cfg(test)]
mod testing;

use crate::cli::Args;
use crate::config::Config;
use crate::cycle::CollectionCycle;
use crate::sensors::SystemSensors;
use crate::service::MetricService;
use crate::sink::{InfluxSink, InfluxTarget};
use anyhow::Result;
use clap::Parser;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ohm_influxdb=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error=%err, "failed to install SIGTERM handler"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error=%err, "failed to listen for ctrl-c");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref());
    config.verbose |= args.verbose;

    let address = config.address()?;
    let target = InfluxTarget::new(&address, &config.database)?
        .with_tag("host", config.machine_name.clone());
    tracing::info!(url = %target.write_url(), "influxdb write endpoint");
    let database = config.database.clone();
    let (sink, sink_handle) = InfluxSink::builder(target)
        .flush_interval(config.interval())
        .batch_size(config.batch_size)
        .max_buffered(config.max_buffered)
        .on_error(move |err| {
            tracing::error!(database = %database, error = %err, "failed to write metrics to influxdb");
        })
        .spawn()?;

    let service = MetricService::start(
        Box::new(SystemSensors::new()),
        Arc::new(sink.clone()),
        config.interval(),
        CollectionCycle::new(config.verbose),
    )
    .await?;
    tracing::info!("ohm-influxdb running");

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    service.stop().await?;
    if let Err(err) = sink.shutdown().await {
        tracing::warn!(error=%err, "failed to flush metrics on shutdown");
    }
    let _ = sink_handle.await;

    let stats = sink.stats();
    tracing::info!(
        sent = stats.points_sent.load(Ordering::Relaxed),
        dropped = stats.points_dropped.load(Ordering::Relaxed),
        failed_flushes = stats.flush_failures.load(Ordering::Relaxed),
        "ohm-influxdb stopped"
    );
    Ok(())
}
