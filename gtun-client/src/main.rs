//! gtun - TUN tunnel client.
//!
//! Opens a local TUN device, authorizes against a gtun server and relays raw
//! IP packets between the two, reconnecting when the link drops.

mod config;
mod device;
mod netconf;
mod relay;
mod tunnel;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::ClientConfig;
use netconf::{IpCommand, NetConfigurator};
use relay::{Relay, RelayStats};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use tunnel::{failure_channel, Dialer, FailureReceiver, Supervisor, TcpDialer};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration
    let config = ClientConfig::parse();

    // Initialize logging
    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    info!("Starting gtun v{}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}", config.server);

    let device = device::open(&config.dev).context("failed to open TUN device")?;
    info!("Device: {}", device.name());

    let mut supervisor = Supervisor::new(config.session(), TcpDialer, IpCommand);
    let address = supervisor.establish().await?;
    info!("Tunnel established, local address {}", address);

    let (device_reader, device_writer) = device.split();
    let (reporter, failures) = failure_channel();
    let stats = Arc::new(RelayStats::default());
    let mut relay = Relay::spawn(
        device_reader,
        device_writer,
        supervisor.links(),
        reporter,
        stats.clone(),
    );

    let outcome = serve(
        &mut supervisor,
        &mut relay,
        failures,
        &config.dev,
        wait_for_signal(),
    )
    .await;

    relay.shutdown().await;
    let session = supervisor.session();
    info!(
        "Session to {} ended in state {} (address {:?}, {} reconnects)",
        session.server_address(),
        *supervisor.state().borrow(),
        session.assigned_address(),
        session.reconnects()
    );
    info!("Relay totals: {}", stats.snapshot());

    outcome
}

/// Run until the supervisor gives up, the relay loses the device, or
/// `shutdown` resolves. Only `shutdown` counts as a clean exit.
async fn serve<D, C>(
    supervisor: &mut Supervisor<D, C>,
    relay: &mut Relay,
    failures: FailureReceiver,
    device: &str,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    D: Dialer,
    C: NetConfigurator,
{
    tokio::select! {
        res = supervisor.run(failures) => res.map_err(anyhow::Error::from),
        _ = relay.stopped() => Err(anyhow!("relay stopped: TUN device {} is gone", device)),
        _ = shutdown => Ok(()),
    }
}

/// Resolve on SIGINT, SIGTERM or SIGHUP.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = unix_signal(tokio::signal::unix::SignalKind::terminate());
    #[cfg(unix)]
    let hangup = unix_signal(tokio::signal::unix::SignalKind::hangup());

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = hangup => info!("Received SIGHUP, shutting down"),
    }
}

#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            error!("Failed to install signal handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
