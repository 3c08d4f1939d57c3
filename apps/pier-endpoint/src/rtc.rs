//! webrtc-rs implementation of the peer-connection contract.

use std::sync::Arc;

use async_trait::async_trait;
use pier_proto::{IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::error::{MediaError, StackError};
use crate::stack::{LinkEvents, MediaKind, MediaSource, PeerLink, PeerStack, RemoteTrack};

pub type LocalTrack = Arc<TrackLocalStaticSample>;

pub struct WebRtcStack {
    api: API,
}

impl WebRtcStack {
    pub fn new() -> Result<Self, StackError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| StackError::Setup(err.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| StackError::Setup(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerStack for WebRtcStack {
    type Track = LocalTrack;
    type Link = WebRtcLink;

    async fn connect(
        &self,
        ice_servers: &[String],
        events: LinkEvents,
    ) -> Result<WebRtcLink, StackError> {
        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }
        let peer = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|err| StackError::Setup(err.to_string()))?,
        );

        let candidate_events = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.local_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let track_events = events.clone();
        peer.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            track_events.remote_track(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            });
            Box::pin(async {})
        }));

        let role = events.role();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(%role, ?state, "peer connection state changed");
            Box::pin(async {})
        }));

        Ok(WebRtcLink { peer })
    }
}

pub struct WebRtcLink {
    peer: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    type Track = LocalTrack;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), StackError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(track) as _;
        let sender = self.peer.add_track(local).await?;
        // RTCP has to be drained for interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, StackError> {
        let offer = self.peer.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, StackError> {
        let answer = self.peer.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), StackError> {
        self.peer
            .set_local_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), StackError> {
        self.peer
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|err| StackError::InvalidDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), StackError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer
            .add_ice_candidate(init)
            .await
            .map_err(|err| StackError::InvalidCandidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), StackError> {
        self.peer.close().await?;
        Ok(())
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, StackError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| StackError::InvalidDescription(err.to_string()))
}

/// Opus and VP8 sample tracks with nothing written to them yet; a capture
/// pipeline feeds them with `write_sample`.
pub struct SyntheticMedia {
    stream_id: String,
}

impl SyntheticMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self::new("pier")
    }
}

#[async_trait]
impl MediaSource for SyntheticMedia {
    type Track = LocalTrack;

    async fn acquire(&self) -> Result<Vec<LocalTrack>, MediaError> {
        let track = |mime_type: &str, id: &str| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                id.to_owned(),
                self.stream_id.clone(),
            ))
        };
        Ok(vec![
            track(MIME_TYPE_OPUS, "audio"),
            track(MIME_TYPE_VP8, "video"),
        ])
    }

    fn stop(&self, track: &LocalTrack) {
        debug!(track = track.id(), "stopped local track");
    }
}
