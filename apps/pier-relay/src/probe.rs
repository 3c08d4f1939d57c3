use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use futures_util::{SinkExt, StreamExt};
use pier_proto::{keepalive, Envelope};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Relay WebSocket endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:8443/ws")]
    pub url: String,

    /// Identifier to register as.
    #[arg(long)]
    pub local: String,

    /// Identifier of the counterpart to wait for.
    #[arg(long)]
    pub remote: String,

    /// How long to listen before disconnecting.
    #[arg(long, default_value_t = 30)]
    pub duration_secs: u64,
}

/// Registers a pair with the relay and prints every envelope that arrives.
pub async fn run(args: ProbeArgs) -> Result<()> {
    let (stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(args.url.as_str())).await {
        Ok(result) => result.with_context(|| format!("failed to connect to {}", args.url))?,
        Err(_) => return Err(anyhow!("connection to {} timed out", args.url)),
    };
    let (mut write, mut read) = stream.split();

    let open = Envelope::open(&args.local, &args.remote).encode()?;
    write.send(Message::Text(open)).await?;
    println!("registered {} -> {}", args.local, args.remote);

    let deadline = sleep(Duration::from_secs(args.duration_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = read.next() => {
                let Some(frame) = frame else {
                    println!("relay closed the channel");
                    return Ok(());
                };
                let text = match frame.context("signaling channel failed")? {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        println!("relay closed the channel");
                        return Ok(());
                    }
                    other => {
                        debug!(?other, "ignoring non-text frame");
                        continue;
                    }
                };
                match Envelope::decode(&text) {
                    Ok(envelope) => {
                        println!("{:<8} {}", envelope.kind(), text);
                        if let Some(reply) = keepalive::reply_to(&envelope) {
                            write.send(Message::Text(reply.encode()?)).await?;
                        }
                    }
                    Err(err) => warn!(error = %err, "relay sent an invalid envelope"),
                }
            }
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
