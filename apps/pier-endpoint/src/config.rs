use std::time::Duration;

use clap::Args;
use pier_proto::keepalive::{ENDPOINT_PING_INTERVAL, RECONNECT_DELAY, RECONNECT_JITTER};
use url::Url;

use crate::error::SignalingError;

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Settings of the negotiation state machine.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub local: String,
    pub remote: String,
    pub answer_timeout: Duration,
    /// Consecutive unanswered offers re-sent before giving up.
    pub max_reoffers: u32,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            local: String::new(),
            remote: String::new(),
            answer_timeout: Duration::from_secs(10),
            max_reoffers: 3,
        }
    }
}

impl NegotiatorConfig {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub relay_url: Url,
    pub ice_servers: Vec<String>,
    pub reconnect_delay: Duration,
    pub reconnect_jitter: Duration,
    pub ping_interval: Duration,
    pub negotiator: NegotiatorConfig,
}

impl EndpointConfig {
    /// Default timings for the given relay and identifier pair.
    pub fn new(
        relay_url: &str,
        local: impl Into<String>,
        remote: impl Into<String>,
    ) -> Result<Self, SignalingError> {
        Ok(Self {
            relay_url: websocket_url(relay_url)?,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            reconnect_delay: RECONNECT_DELAY,
            reconnect_jitter: RECONNECT_JITTER,
            ping_interval: ENDPOINT_PING_INTERVAL,
            negotiator: NegotiatorConfig::new(local, remote),
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct EndpointArgs {
    /// Relay address (`ws://`, `wss://`, `http://` or `https://`).
    #[arg(long = "relay", env = "PIER_RELAY_URL", default_value = "ws://127.0.0.1:8443/ws")]
    pub relay_url: String,

    /// Identifier this endpoint registers as.
    #[arg(long, env = "PIER_LOCAL_ID")]
    pub local: String,

    /// Identifier of the endpoint to connect to.
    #[arg(long, env = "PIER_REMOTE_ID")]
    pub remote: String,

    /// STUN/TURN server URLs.
    #[arg(
        long = "ice-server",
        env = "PIER_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_ICE_SERVER
    )]
    pub ice_servers: Vec<String>,

    #[arg(long, default_value_t = 5000)]
    pub reconnect_delay_ms: u64,

    #[arg(long, default_value_t = 1000)]
    pub reconnect_jitter_ms: u64,

    /// Seconds between pings to the relay.
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds to wait for an answer before asking the peer to renegotiate.
    #[arg(long, default_value_t = 10)]
    pub answer_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub max_reoffers: u32,
}

impl TryFrom<EndpointArgs> for EndpointConfig {
    type Error = SignalingError;

    fn try_from(args: EndpointArgs) -> Result<Self, Self::Error> {
        Ok(EndpointConfig {
            relay_url: websocket_url(&args.relay_url)?,
            ice_servers: args
                .ice_servers
                .into_iter()
                .map(|server| server.trim().to_string())
                .filter(|server| !server.is_empty())
                .collect(),
            reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
            reconnect_jitter: Duration::from_millis(args.reconnect_jitter_ms),
            ping_interval: Duration::from_secs(args.ping_interval_secs.max(1)),
            negotiator: NegotiatorConfig {
                local: args.local,
                remote: args.remote,
                answer_timeout: Duration::from_secs(args.answer_timeout_secs.max(1)),
                max_reoffers: args.max_reoffers,
            },
        })
    }
}

/// Normalizes a relay address into the WebSocket URL of its signaling route.
pub fn websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: &str| SignalingError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(invalid("expected a ws, wss, http or https scheme")),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme"))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.set_fragment(None);
    Ok(url)
}
