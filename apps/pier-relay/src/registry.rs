use std::sync::Arc;

use axum::extract::ws::Message;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use pier_proto::{Envelope, StartHint};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Live identifier pairs, shared by every channel handler.
///
/// All reads and writes of the registration list happen under one lock, which
/// is never held across an await: deliveries are `try_send` into the bounded
/// per-connection queues.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Vec<Registration>>>,
}

struct Registration {
    local: String,
    remote: String,
    connection_id: ConnectionId,
    sender: mpsc::Sender<Message>,
}

impl Registration {
    fn is_live(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// A previous registration for the same pair was replaced.
    pub evicted: bool,
    /// Connection of the live counterpart that was sent `start`, if any.
    pub paired_with: Option<ConnectionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered(ConnectionId),
    Unregistered,
    NoCounterpart,
    QueueFull(ConnectionId),
    Closed(ConnectionId),
}

impl ForwardOutcome {
    pub fn drop_reason(&self) -> Option<&'static str> {
        match self {
            ForwardOutcome::Delivered(_) => None,
            ForwardOutcome::Unregistered => Some("unregistered"),
            ForwardOutcome::NoCounterpart => Some("no_counterpart"),
            ForwardOutcome::QueueFull(_) => Some("queue_full"),
            ForwardOutcome::Closed(_) => Some("closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownOutcome {
    pub removed: usize,
    pub notified: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationSnapshot {
    pub local: String,
    pub remote: String,
    pub connection_id: ConnectionId,
    pub live: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `local -> remote` for a connection and starts the pair if the
    /// counterpart is already waiting.
    pub fn register(
        &self,
        local: &str,
        remote: &str,
        connection_id: ConnectionId,
        sender: mpsc::Sender<Message>,
    ) -> RegisterOutcome {
        let mut guard = self.inner.lock();

        let before = guard.len();
        guard.retain(|entry| !(entry.local == local && entry.remote == remote));
        let evicted = guard.len() != before;
        if evicted {
            counter!("pier_relay_evictions_total", 1);
            debug!(local, remote, connection_id, "replaced previous registration");
        }

        guard.push(Registration {
            local: local.to_string(),
            remote: remote.to_string(),
            connection_id,
            sender: sender.clone(),
        });
        gauge!("pier_relay_registrations_active", guard.len() as f64);

        let counterpart = guard.iter().find(|entry| {
            entry.connection_id != connection_id
                && entry.local == remote
                && entry.remote == local
                && entry.is_live()
        });

        let paired_with = counterpart.map(|entry| {
            deliver(&entry.sender, &Envelope::Start(StartHint::Answer));
            deliver(&sender, &Envelope::Start(StartHint::Offer));
            entry.connection_id
        });
        if let Some(other) = paired_with {
            counter!("pier_relay_pairings_total", 1);
            info!(local, remote, connection_id, counterpart = other, "pair started");
        }

        RegisterOutcome {
            evicted,
            paired_with,
        }
    }

    /// Hands a raw frame to the live registration whose `local` is `target`.
    pub fn forward(&self, from: ConnectionId, target: &str, frame: Message) -> ForwardOutcome {
        let guard = self.inner.lock();

        if !guard.iter().any(|entry| entry.connection_id == from) {
            return ForwardOutcome::Unregistered;
        }

        let Some(destination) = guard
            .iter()
            .find(|entry| entry.local == target && entry.is_live())
        else {
            return ForwardOutcome::NoCounterpart;
        };

        match destination.sender.try_send(frame) {
            Ok(()) => ForwardOutcome::Delivered(destination.connection_id),
            Err(TrySendError::Full(_)) => ForwardOutcome::QueueFull(destination.connection_id),
            Err(TrySendError::Closed(_)) => ForwardOutcome::Closed(destination.connection_id),
        }
    }

    /// Drops every registration held by a connection and tells each live
    /// counterpart that its peer went away.
    pub fn teardown(&self, connection_id: ConnectionId) -> TeardownOutcome {
        let mut guard = self.inner.lock();

        let (removed, kept): (Vec<Registration>, Vec<Registration>) = guard
            .drain(..)
            .partition(|entry| entry.connection_id == connection_id);
        *guard = kept;
        gauge!("pier_relay_registrations_active", guard.len() as f64);

        let mut outcome = TeardownOutcome {
            removed: removed.len(),
            notified: 0,
        };
        // One close per counterpart connection, however many pairs pointed at it.
        let mut notified: Vec<ConnectionId> = Vec::new();
        for gone in &removed {
            let counterpart = guard
                .iter()
                .find(|entry| entry.local == gone.remote && entry.is_live())
                .filter(|entry| !notified.contains(&entry.connection_id));
            if let Some(entry) = counterpart {
                notified.push(entry.connection_id);
                deliver(&entry.sender, &Envelope::Close);
                outcome.notified += 1;
                info!(
                    local = %gone.local,
                    remote = %gone.remote,
                    notified = entry.connection_id,
                    "counterpart notified of close"
                );
            }
        }

        outcome
    }

    pub fn snapshot(&self) -> Vec<RegistrationSnapshot> {
        self.inner
            .lock()
            .iter()
            .map(|entry| RegistrationSnapshot {
                local: entry.local.clone(),
                remote: entry.remote.clone(),
                connection_id: entry.connection_id,
                live: entry.is_live(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Serializes a relay-originated envelope and queues it without waiting.
pub(crate) fn deliver(sender: &mpsc::Sender<Message>, envelope: &Envelope) -> bool {
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(kind = envelope.kind(), error = %err, "failed to encode envelope");
            return false;
        }
    };
    match sender.try_send(Message::Text(text)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            counter!("pier_relay_envelopes_dropped_total", 1, "reason" => "queue_full");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
