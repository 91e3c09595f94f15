use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vnet_p2p::config::Args;
use vnet_p2p::server::{Server, SwitchHandle};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    info!(size = args.size, "vnet-p2p starting");

    let (server, handle) = Server::new(args.size);
    let dispatcher = thread::Builder::new()
        .name("vnet-p2p".into())
        .spawn(move || server.run())
        .context("failed to spawn dispatcher thread")?;

    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;

    let stats = (args.stats_interval > 0)
        .then(|| tokio::spawn(log_stats(handle.clone(), args.stats_interval)));

    tokio::select! {
        _ = sigint.recv() => { info!("Received SIGINT"); }
        _ = sigterm.recv() => { info!("Received SIGTERM"); }
    }

    if let Some(task) = stats {
        task.abort();
    }

    info!("Shutting down...");
    handle.shutdown();
    dispatcher
        .join()
        .map_err(|_| anyhow::anyhow!("dispatcher thread panicked"))?;

    info!("vnet-p2p stopped");
    Ok(())
}

async fn log_stats(handle: SwitchHandle, secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let handle = handle.clone();
        // The dispatcher reply is a blocking channel receive
        let Ok(Some(stats)) = tokio::task::spawn_blocking(move || handle.stats()).await else {
            break;
        };
        for (port, s) in stats.iter().enumerate() {
            info!(
                port,
                tx = s.tx_packets,
                rx = s.rx_packets,
                dropped = s.dropped,
                irqs = s.irqs,
                "port statistics"
            );
        }
    }
}
