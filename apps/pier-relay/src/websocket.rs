use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use pier_proto::{keepalive, Envelope, EnvelopeError};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::registry::{deliver, ConnectionId};
use crate::RelayState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let connection_id = state.next_connection_id();
    let active = state.connection_opened();
    counter!("pier_relay_connections_total", 1);
    gauge!("pier_relay_connections_active", active as f64);
    info!(connection_id, "signaling channel opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config().channel_depth);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });
    let pinger = spawn_pinger(tx.clone(), state.config().ping_interval);

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                debug!(connection_id, error = %err, "signaling channel errored");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let decoded = Envelope::decode(&text);
                dispatch(&state, connection_id, &tx, decoded, Message::Text(text));
            }
            Message::Binary(bytes) => {
                let decoded = Envelope::decode_slice(&bytes);
                dispatch(&state, connection_id, &tx, decoded, Message::Binary(bytes));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    pinger.abort();
    let teardown = state.registry().teardown(connection_id);
    let active = state.connection_closed();
    gauge!("pier_relay_connections_active", active as f64);
    writer.abort();

    info!(
        connection_id,
        registrations = teardown.removed,
        notified = teardown.notified,
        "signaling channel closed"
    );
}

fn dispatch(
    state: &RelayState,
    connection_id: ConnectionId,
    tx: &mpsc::Sender<Message>,
    decoded: Result<Envelope, EnvelopeError>,
    frame: Message,
) {
    let envelope = match decoded {
        Ok(envelope) => envelope,
        Err(err) => {
            counter!("pier_relay_malformed_total", 1);
            debug!(connection_id, error = %err, "ignoring malformed frame");
            return;
        }
    };

    if let Some(reply) = keepalive::reply_to(&envelope) {
        deliver(tx, &reply);
        return;
    }

    match &envelope {
        Envelope::Open(request) => {
            let outcome =
                state
                    .registry()
                    .register(&request.local, &request.remote, connection_id, tx.clone());
            info!(
                connection_id,
                local = %request.local,
                remote = %request.remote,
                evicted = outcome.evicted,
                paired = outcome.paired_with.is_some(),
                "registered"
            );
        }
        Envelope::Sdp(_) | Envelope::Ice(_) | Envelope::ReOffer(_) => {
            forward(state, connection_id, &envelope, frame);
        }
        Envelope::Pong => {}
        other => {
            debug!(connection_id, kind = other.kind(), "ignoring relay-bound envelope");
        }
    }
}

fn forward(state: &RelayState, connection_id: ConnectionId, envelope: &Envelope, frame: Message) {
    let Some(target) = envelope.target() else {
        warn!(connection_id, kind = envelope.kind(), "envelope has no target");
        return;
    };

    let outcome = state.registry().forward(connection_id, target, frame);
    match outcome.drop_reason() {
        None => {
            counter!("pier_relay_envelopes_forwarded_total", 1, "kind" => envelope.kind());
            debug!(connection_id, target, kind = envelope.kind(), "forwarded");
        }
        Some(reason) => {
            counter!("pier_relay_envelopes_dropped_total", 1, "reason" => reason);
            debug!(
                connection_id,
                target,
                kind = envelope.kind(),
                reason,
                "dropped envelope"
            );
        }
    }
}

fn spawn_pinger(tx: mpsc::Sender<Message>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            deliver(&tx, &Envelope::Ping);
        }
    })
}
