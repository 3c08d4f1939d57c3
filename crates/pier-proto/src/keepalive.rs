use std::time::Duration;

use crate::Envelope;

/// Interval at which the relay pings every connected channel.
pub const RELAY_PING_INTERVAL: Duration = Duration::from_secs(180);

/// Interval at which an endpoint pings the relay.
pub const ENDPOINT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Base delay before an endpoint reopens a dropped signaling channel.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Upper bound of the random delay added to [`RECONNECT_DELAY`].
pub const RECONNECT_JITTER: Duration = Duration::from_secs(1);

/// The immediate reply owed for an incoming envelope, if any.
///
/// Only `ping` demands one. Replies carry no state, so every ping gets its own
/// pong.
pub fn reply_to(envelope: &Envelope) -> Option<Envelope> {
    match envelope {
        Envelope::Ping => Some(Envelope::Pong),
        _ => None,
    }
}
