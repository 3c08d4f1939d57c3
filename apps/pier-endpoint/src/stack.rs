use std::fmt;

use async_trait::async_trait;
use pier_proto::{IceCandidate, SessionDescription, SessionToken};
use tokio::sync::mpsc;

use crate::error::{MediaError, StackError};
use crate::machine::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Description of a track the remote endpoint is sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
}

/// A [`LinkEvent`] stamped with the negotiation attempt that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedLinkEvent {
    pub role: Role,
    pub token: Option<SessionToken>,
    pub event: LinkEvent,
}

/// Callback sink handed to every new peer connection.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    role: Role,
    token: Option<SessionToken>,
    tx: mpsc::UnboundedSender<TaggedLinkEvent>,
}

impl LinkEvents {
    pub fn new(
        role: Role,
        token: Option<SessionToken>,
        tx: mpsc::UnboundedSender<TaggedLinkEvent>,
    ) -> Self {
        Self { role, token, tx }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(LinkEvent::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.emit(LinkEvent::RemoteTrack(track));
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(TaggedLinkEvent {
            role: self.role,
            token: self.token.clone(),
            event,
        });
    }
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerStack: Send + Sync + 'static {
    type Track: Clone + Send + Sync + 'static;
    type Link: PeerLink<Track = Self::Track>;

    async fn connect(
        &self,
        ice_servers: &[String],
        events: LinkEvents,
    ) -> Result<Self::Link, StackError>;
}

/// One peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    type Track: Send + Sync;

    async fn add_track(&self, track: &Self::Track) -> Result<(), StackError>;
    async fn create_offer(&self) -> Result<SessionDescription, StackError>;
    async fn create_answer(&self) -> Result<SessionDescription, StackError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), StackError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), StackError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), StackError>;
    async fn close(&self) -> Result<(), StackError>;
}

/// Local capture devices.
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    type Track: Clone + Send + Sync + 'static;

    /// Acquires one audio and one video track.
    async fn acquire(&self) -> Result<Vec<Self::Track>, MediaError>;
    fn stop(&self, track: &Self::Track);
}
