use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread;

use nowplaying_presence::artwork::ItunesArtwork;
use nowplaying_presence::bridge::Bridge;
use nowplaying_presence::config::BridgeConfig;
use nowplaying_presence::probe::{spawn_peer_watch, ProcessProbe, SystemProcesses};
use nowplaying_presence::session::{SessionMonitor, SessionSource};
use nowplaying_presence::sidecar::SidecarSource;
use nowplaying_presence::transport::{endpoint_candidates, LocalConnector, TransportClient};

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    log::info!("Starting now-playing presence bridge");

    if let Err(e) = run() {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BridgeConfig::from_env()?;

    let sidecar_command = config
        .sidecar
        .clone()
        .context("PRESENCE_SIDECAR is not set; it should name the media session reader to run")?;
    let sidecar = Arc::new(SidecarSource::spawn(&sidecar_command)?);

    let endpoints = endpoint_candidates(&config.endpoint_prefix, config.endpoint_count);
    log::debug!("IPC endpoints: {:?}", endpoints);
    let transport = TransportClient::new(
        config.client_id.clone(),
        endpoints,
        Box::new(LocalConnector::new()),
    );

    let monitor = SessionMonitor::new(
        Arc::clone(&sidecar) as Arc<dyn SessionSource>,
        config.target_app.clone(),
        config.seek_tolerance,
    );
    let probe: Arc<dyn ProcessProbe> = Arc::new(SystemProcesses);
    let artwork = Arc::new(ItunesArtwork::new()?);

    let bridge = Bridge::new(
        config.clone(),
        transport,
        monitor,
        Arc::clone(&probe),
        artwork,
    );
    let handle = bridge.handle();

    let watcher = spawn_peer_watch(
        probe,
        config.peer_process.clone(),
        config.probe_interval,
        handle.clone(),
    )
    .context("Failed to start peer probe")?;

    // Setup signal handler for Ctrl+C (SIGINT) and SIGTERM
    let signal_handle = handle.clone();
    ctrlc::set_handler(move || {
        log::info!("Received interrupt signal, shutting down...");
        signal_handle.shutdown();
    })
    .context("Failed to set signal handler")?;

    let worker = thread::Builder::new()
        .name("bridge".to_string())
        .spawn(move || bridge.run())
        .context("Failed to start bridge loop")?;

    if worker.join().is_err() {
        log::error!("Bridge loop panicked");
    }
    // The loop can also end on its own; make sure the probe sees it
    handle.shutdown();
    if watcher.join().is_err() {
        log::error!("Peer probe panicked");
    }

    sidecar.stop()?;
    log::info!("Shutdown complete");
    Ok(())
}
