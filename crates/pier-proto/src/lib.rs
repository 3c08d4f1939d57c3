//! Shared wire protocol for the pier relay and its endpoints.
//! Every frame on the signaling channel is one JSON object carrying exactly one
//! discriminant key (`open`, `start`, `sdp`, ...); see [`Envelope`].

pub mod envelope;
pub mod keepalive;
pub mod token;

pub use envelope::{
    Envelope, EnvelopeError, IceCandidate, OpenRequest, ReOffer, Routed, SdpKind,
    SessionDescription, StartHint,
};
pub use token::SessionToken;
