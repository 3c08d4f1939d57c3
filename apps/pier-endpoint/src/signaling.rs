use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pier_proto::Envelope;
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EndpointConfig;
use crate::error::SignalingError;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Envelope(Envelope),
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: Url,
    pub reconnect_delay: Duration,
    pub reconnect_jitter: Duration,
    pub ping_interval: Duration,
}

impl From<&EndpointConfig> for SignalingConfig {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            url: config.relay_url.clone(),
            reconnect_delay: config.reconnect_delay,
            reconnect_jitter: config.reconnect_jitter,
            ping_interval: config.ping_interval,
        }
    }
}

/// Relay connection that keeps itself open.
///
/// Each connection attempt runs under a generation number. When a channel
/// drops, the attempt that owned it bumps the generation and schedules the next
/// one after the reconnect delay plus jitter; a scheduled attempt only runs if
/// its generation is still the current one, so [`SignalingClient::shutdown`]
/// cancels everything by bumping the generation once more.
pub struct SignalingClient {
    config: SignalingConfig,
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl SignalingClient {
    pub fn start(
        config: SignalingConfig,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            config,
            generation: AtomicU64::new(0),
            outbound: Mutex::new(None),
            events,
            tasks: Mutex::new(Vec::new()),
        });
        client.schedule(0, Duration::ZERO);
        client
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Queues an envelope on the live channel. Nothing is buffered while
    /// disconnected.
    pub fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        let frame = Message::Text(envelope.encode()?);
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SignalingError::NotConnected);
        };
        tx.send(frame).map_err(|_| SignalingError::NotConnected)
    }

    pub fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.outbound.lock().take();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    fn schedule(self: &Arc<Self>, generation: u64, delay: Duration) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if client.generation() != generation {
                debug!(generation, "skipping stale reconnect");
                return;
            }
            client.run_connection(generation).await;
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn run_connection(self: Arc<Self>, generation: u64) {
        debug!(url = %self.config.url, generation, "connecting to relay");
        match connect_async(self.config.url.as_str()).await {
            Ok((stream, _)) => self.pump(stream, generation).await,
            Err(err) => warn!(url = %self.config.url, error = %err, "relay connection failed"),
        }

        let next = generation + 1;
        if self
            .generation
            .compare_exchange(generation, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let _ = self.events.send(SignalingEvent::Disconnected);
        let delay = self.reconnect_delay();
        info!(
            delay_ms = delay.as_millis() as u64,
            "signaling channel closed; reconnecting"
        );
        self.schedule(next, delay);
    }

    async fn pump(&self, stream: RelayStream, generation: u64) {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut outbound = self.outbound.lock();
            if self.generation() != generation {
                return;
            }
            *outbound = Some(tx.clone());
        }
        info!(url = %self.config.url, "signaling channel open");
        let _ = self.events.send(SignalingEvent::Connected);

        let _writer = AbortOnDrop(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write.send(frame).await.is_err() {
                    break;
                }
            }
        }));
        let _heartbeat = AbortOnDrop(spawn_heartbeat(tx, self.config.ping_interval));

        while let Some(frame) = read.next().await {
            let decoded = match frame {
                Ok(Message::Text(text)) => Envelope::decode(&text),
                Ok(Message::Binary(bytes)) => Envelope::decode_slice(&bytes),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            debug!("signaling channel closed: {err}");
                        }
                        _ => warn!("signaling channel error: {err}"),
                    }
                    break;
                }
            };
            match decoded {
                Ok(envelope) => {
                    let _ = self.events.send(SignalingEvent::Envelope(envelope));
                }
                Err(err) => debug!(error = %err, "ignoring invalid envelope"),
            }
        }

        let mut outbound = self.outbound.lock();
        if self.generation() == generation {
            outbound.take();
        }
    }

    fn reconnect_delay(&self) -> Duration {
        let jitter_ms = self.config.reconnect_jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.config.reconnect_delay + Duration::from_millis(extra)
    }
}

/// Writer and heartbeat tasks own halves of the socket; they must not outlive
/// the read loop, even when it is aborted.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_heartbeat(tx: mpsc::UnboundedSender<Message>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ping = match Envelope::Ping.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode ping; heartbeat disabled");
                return;
            }
        };
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(Message::Text(ping.clone())).is_err() {
                break;
            }
        }
    })
}
