use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::SessionToken;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope carries no discriminant key")]
    Empty,
    #[error("envelope carries several discriminant keys: {0}")]
    Ambiguous(String),
    #[error("`{0}` envelope is missing its `remote` target")]
    MissingRemote(&'static str),
}

/// Identifier pair announced by an endpoint when it registers with the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub local: String,
    pub remote: String,
}

/// Role hint attached to `start`. The relay tells the newly registered side to
/// offer and the side that was already waiting to answer; older relays send `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartHint {
    Offer,
    Answer,
    Unspecified,
}

impl StartHint {
    fn from_value(value: &Value) -> Self {
        match value.as_str() {
            Some("offer") => StartHint::Offer,
            Some("answer") => StartHint::Answer,
            _ => StartHint::Unspecified,
        }
    }

    fn to_value(self) -> Value {
        match self {
            StartHint::Offer => Value::from("offer"),
            StartHint::Answer => Value::from("answer"),
            StartHint::Unspecified => Value::from(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the shape browsers produce with `toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Payload addressed to a remote endpoint, optionally scoped to a negotiation
/// attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed<T> {
    pub payload: T,
    pub remote: String,
    pub token: Option<SessionToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReOffer {
    pub remote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<SessionToken>,
}

/// One signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub enum Envelope {
    Open(OpenRequest),
    Start(StartHint),
    Close,
    Ping,
    Pong,
    Sdp(Routed<SessionDescription>),
    Ice(Routed<IceCandidate>),
    ReOffer(ReOffer),
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn open(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Envelope::Open(OpenRequest {
            local: local.into(),
            remote: remote.into(),
        })
    }

    pub fn sdp(
        description: SessionDescription,
        remote: impl Into<String>,
        token: Option<SessionToken>,
    ) -> Self {
        Envelope::Sdp(Routed {
            payload: description,
            remote: remote.into(),
            token,
        })
    }

    pub fn ice(
        candidate: IceCandidate,
        remote: impl Into<String>,
        token: Option<SessionToken>,
    ) -> Self {
        Envelope::Ice(Routed {
            payload: candidate,
            remote: remote.into(),
            token,
        })
    }

    pub fn re_offer(remote: impl Into<String>, token: Option<SessionToken>) -> Self {
        Envelope::ReOffer(ReOffer {
            remote: remote.into(),
            token,
        })
    }

    /// Discriminant key, for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Open(_) => "open",
            Envelope::Start(_) => "start",
            Envelope::Close => "close",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
            Envelope::Sdp(_) => "sdp",
            Envelope::Ice(_) => "ice",
            Envelope::ReOffer(_) => "re_offer",
        }
    }

    /// Identifier of the endpoint this envelope must be forwarded to. Only
    /// endpoint-to-endpoint messages have one.
    pub fn target(&self) -> Option<&str> {
        match self {
            Envelope::Sdp(routed) => Some(&routed.remote),
            Envelope::Ice(routed) => Some(&routed.remote),
            Envelope::ReOffer(request) => Some(&request.remote),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<&SessionToken> {
        match self {
            Envelope::Sdp(routed) => routed.token.as_ref(),
            Envelope::Ice(routed) => routed.token.as_ref(),
            Envelope::ReOffer(request) => request.token.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    open: Option<OpenRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    close: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ping: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pong: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ice: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    re_offer: Option<ReOffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<SessionToken>,
}

impl RawEnvelope {
    fn discriminants(&self) -> Vec<&'static str> {
        [
            ("open", self.open.is_some()),
            ("start", self.start.is_some()),
            ("close", self.close.is_some()),
            ("ping", self.ping.is_some()),
            ("pong", self.pong.is_some()),
            ("sdp", self.sdp.is_some()),
            ("ice", self.ice.is_some()),
            ("re_offer", self.re_offer.is_some()),
        ]
        .into_iter()
        .filter_map(|(key, present)| present.then_some(key))
        .collect()
    }
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let present = raw.discriminants();
        if present.len() > 1 {
            return Err(EnvelopeError::Ambiguous(present.join(", ")));
        }

        let RawEnvelope {
            open,
            start,
            close,
            ping,
            pong,
            sdp,
            ice,
            re_offer,
            remote,
            token,
        } = raw;

        if let Some(open) = open {
            return Ok(Envelope::Open(open));
        }
        if let Some(hint) = start {
            return Ok(Envelope::Start(StartHint::from_value(&hint)));
        }
        if close.is_some() {
            return Ok(Envelope::Close);
        }
        if ping.is_some() {
            return Ok(Envelope::Ping);
        }
        if pong.is_some() {
            return Ok(Envelope::Pong);
        }
        if let Some(description) = sdp {
            let remote = remote.ok_or(EnvelopeError::MissingRemote("sdp"))?;
            return Ok(Envelope::sdp(description, remote, token));
        }
        if let Some(candidate) = ice {
            let remote = remote.ok_or(EnvelopeError::MissingRemote("ice"))?;
            return Ok(Envelope::ice(candidate, remote, token));
        }
        if let Some(request) = re_offer {
            return Ok(Envelope::ReOffer(request));
        }
        Err(EnvelopeError::Empty)
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let flag = || Some(Value::from(1));
        match envelope {
            Envelope::Open(open) => RawEnvelope {
                open: Some(open),
                ..Default::default()
            },
            Envelope::Start(hint) => RawEnvelope {
                start: Some(hint.to_value()),
                ..Default::default()
            },
            Envelope::Close => RawEnvelope {
                close: flag(),
                ..Default::default()
            },
            Envelope::Ping => RawEnvelope {
                ping: flag(),
                ..Default::default()
            },
            Envelope::Pong => RawEnvelope {
                pong: flag(),
                ..Default::default()
            },
            Envelope::Sdp(routed) => RawEnvelope {
                sdp: Some(routed.payload),
                remote: Some(routed.remote),
                token: routed.token,
                ..Default::default()
            },
            Envelope::Ice(routed) => RawEnvelope {
                ice: Some(routed.payload),
                remote: Some(routed.remote),
                token: routed.token,
                ..Default::default()
            },
            Envelope::ReOffer(request) => RawEnvelope {
                re_offer: Some(request),
                ..Default::default()
            },
        }
    }
}
