use anyhow::{Context, Result};
use clap::Parser;
use pier_endpoint::{EndpointArgs, EndpointConfig, EndpointEvent, SyntheticMedia, WebRtcStack};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "pier",
    author,
    version,
    about = "Connects to a pier relay and negotiates media with the paired endpoint"
)]
struct Cli {
    #[command(flatten)]
    endpoint: EndpointArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let cli = Cli::parse();
    let config = EndpointConfig::try_from(cli.endpoint)?;
    let stack = WebRtcStack::new().context("failed to build WebRTC stack")?;
    let mut handle = pier_endpoint::spawn(config, stack, SyntheticMedia::default());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = handle.next_event() => match event {
                Some(EndpointEvent::Negotiated { role, token }) => {
                    info!(%role, token = ?token.as_ref().map(|t| t.as_str()), "negotiated");
                }
                Some(EndpointEvent::RemoteTrack { role, track }) => {
                    info!(%role, id = %track.id, kind = %track.kind, "remote track");
                }
                Some(EndpointEvent::RemoteMediaStopped) => info!("remote media stopped"),
                Some(EndpointEvent::Failure(err)) => warn!(error = %err, "negotiation failed"),
                None => break,
            },
        }
    }

    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
