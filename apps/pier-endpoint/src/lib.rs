//! Endpoint side of pier.
//!
//! An endpoint registers `(local, remote)` with a relay and runs two peer
//! connections against the endpoint registered as `(remote, local)`: one it
//! offers on (initiator, sends local media) and one it answers on (responder,
//! receives remote media). [`spawn`] wires the relay client, the
//! [`Negotiator`] state machine and a [`PeerStack`] together.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod machine;
pub mod queue;
pub mod rtc;
pub mod signaling;
pub mod stack;

pub use config::{EndpointArgs, EndpointConfig, NegotiatorConfig};
pub use endpoint::{spawn, EndpointHandle};
pub use error::{MediaError, NegotiationError, SignalingError, StackError};
pub use machine::{
    Action, EndpointEvent, InitiatorState, Input, MediaState, Negotiator, ResponderState, Role,
};
pub use rtc::{SyntheticMedia, WebRtcStack};
pub use signaling::{SignalingClient, SignalingConfig, SignalingEvent};
pub use stack::{LinkEvents, MediaKind, MediaSource, PeerLink, PeerStack, RemoteTrack};
