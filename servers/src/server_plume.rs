use anyhow::Result;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use lib_radstream::ingestors::{ParticleFeed, ParticleFeedConfig, SensorPoller, SensorPollerConfig};
use lib_radstream::loggers::setup_logging;
use lib_radstream::retrieve::QueryClient;
use lib_radstream::transport::{StreamClient, WsConnector};

mod plume_logic;
use plume_logic::{config, output};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    setup_logging(settings.server.log_dir(), "server_plume", settings.server.log_level())?;
    let core = &settings.core;

    let connector = WsConnector::new(&core.stream_url, Duration::from_millis(core.connect_timeout_ms))?;
    let client = StreamClient::spawn(connector, core.reconnect.clone());
    client.connect()?;

    let cancel = CancellationToken::new();
    let target = settings.server.simulation_target();
    if target.is_none() {
        log::warn!("No simulation id configured; the particle feed stays idle.");
    }
    let (target_tx, target_rx) = watch::channel(target);

    let (feed, zones_rx) = ParticleFeed::new(client.clone(), ParticleFeedConfig::from(core));
    let mut handles = vec![tokio::spawn(feed.run(target_rx, cancel.clone()))];

    let clusters_rx = if settings.server.sensors.unwrap_or(true) {
        let query = QueryClient::new(&core.query_url, core.auth_token.clone())?;
        let (poller, rx) = SensorPoller::new(query, SensorPollerConfig::from(core));
        handles.push(tokio::spawn(poller.run(cancel.clone())));
        Some(rx)
    } else {
        None
    };

    handles.push(tokio::spawn(output::run(
        settings.server.output_dir.clone(),
        zones_rx,
        clusters_rx,
        client.watch_state(),
        cancel.clone(),
    )));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    cancel.cancel();
    drop(target_tx);
    for handle in handles {
        if let Err(e) = handle.await {
            log::error!("Task ended abnormally: {}", e);
        }
    }
    client.shutdown();

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
