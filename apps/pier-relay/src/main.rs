use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pier_relay::{RelayConfig, RelayState, ServeArgs};
use tokio::{net::TcpListener, signal};
use tracing::info;

mod probe;
mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "pier-relay",
    author,
    version,
    about = "Pairs pier endpoints by identifier and relays their signaling"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a pair with a running relay and print what it sends.
    Probe(probe::ProbeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging()?;

    let cli = Cli::parse();
    if let Some(Command::Probe(args)) = cli.command {
        return probe::run(args).await;
    }

    let metrics = telemetry::install_metrics()?;
    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        ping_interval_secs = config.ping_interval.as_secs(),
        channel_depth = config.channel_depth,
        "starting pier relay"
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let grace = config.shutdown_grace;
    let state = RelayState::with_metrics(config, metrics);

    pier_relay::serve(listener, state, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
