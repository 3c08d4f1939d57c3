use thiserror::Error;

use crate::machine::Role;

/// Failure reported by a peer-connection stack.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("peer connection operation failed: {0}")]
    Operation(String),
}

impl From<webrtc::Error> for StackError {
    fn from(err: webrtc::Error) -> Self {
        StackError::Operation(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] pier_proto::EnvelopeError),
}

/// Problems surfaced to the user through [`crate::EndpointEvent::Failure`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("{role} peer connection failed: {message}")]
    Stack { role: Role, message: String },
    #[error("media acquisition failed: {0}")]
    Media(String),
    #[error("no answer after {attempts} offers; waiting for the next start")]
    AnswerTimeout { attempts: u32 },
}
