use std::{net::SocketAddr, time::Duration};

use clap::Args;
use pier_proto::keepalive::RELAY_PING_INTERVAL;

use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub ping_interval: Duration,
    /// Capacity of each connection's outbound queue.
    pub channel_depth: usize,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            ping_interval: RELAY_PING_INTERVAL,
            channel_depth: 64,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the signaling listener to.
    #[arg(long, env = "PIER_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: String,

    /// Seconds between relay-originated pings on every channel.
    #[arg(long, env = "PIER_RELAY_PING_INTERVAL_SECS", default_value_t = 180)]
    pub ping_interval_secs: u64,

    /// Outbound queue depth per connection; frames beyond it are dropped.
    #[arg(long, env = "PIER_RELAY_CHANNEL_DEPTH", default_value_t = 64)]
    pub channel_depth: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PIER_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = RelayError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr =
            args.listen_addr
                .parse()
                .map_err(|source| RelayError::InvalidListenAddr {
                    addr: args.listen_addr.clone(),
                    source,
                })?;
        if args.ping_interval_secs == 0 {
            return Err(RelayError::ZeroSetting("ping interval"));
        }
        if args.channel_depth == 0 {
            return Err(RelayError::ZeroSetting("channel depth"));
        }
        Ok(RelayConfig {
            listen_addr,
            ping_interval: Duration::from_secs(args.ping_interval_secs),
            channel_depth: args.channel_depth,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
