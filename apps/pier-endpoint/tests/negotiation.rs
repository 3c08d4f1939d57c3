use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use pier_endpoint::{
    EndpointConfig, EndpointEvent, EndpointHandle, LinkEvents, MediaError, MediaKind, MediaSource,
    NegotiationError, PeerLink, PeerStack, RemoteTrack, Role, StackError,
};
use pier_proto::{IceCandidate, SdpKind, SessionDescription};
use pier_relay::{RelayConfig, RelayState};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    time::{sleep, timeout},
};

#[derive(Debug, Default)]
struct StackLog {
    links: usize,
    tracks_added: usize,
    candidates_added: usize,
}

/// In-memory stack: descriptions are opaque strings, every local description
/// yields one host candidate and every applied offer yields one remote track.
#[derive(Clone, Default)]
struct MockStack {
    log: Arc<Mutex<StackLog>>,
    reject_candidates: bool,
}

impl MockStack {
    fn rejecting_candidates() -> Self {
        Self {
            reject_candidates: true,
            ..Self::default()
        }
    }
}

struct MockLink {
    events: LinkEvents,
    log: Arc<Mutex<StackLog>>,
    reject_candidates: bool,
}

#[async_trait]
impl PeerStack for MockStack {
    type Track = String;
    type Link = MockLink;

    async fn connect(
        &self,
        _ice_servers: &[String],
        events: LinkEvents,
    ) -> Result<MockLink, StackError> {
        self.log.lock().links += 1;
        Ok(MockLink {
            events,
            log: Arc::clone(&self.log),
            reject_candidates: self.reject_candidates,
        })
    }
}

#[async_trait]
impl PeerLink for MockLink {
    type Track = String;

    async fn add_track(&self, _track: &String) -> Result<(), StackError> {
        self.log.lock().tracks_added += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, StackError> {
        Ok(SessionDescription::offer("v=0\r\nm=audio\r\nm=video\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, StackError> {
        Ok(SessionDescription::answer("v=0\r\nm=audio\r\nm=video\r\n"))
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), StackError> {
        self.events.local_candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), StackError> {
        if description.kind == SdpKind::Offer {
            self.events.remote_track(RemoteTrack {
                id: "audio".into(),
                stream_id: "remote".into(),
                kind: MediaKind::Audio,
            });
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), StackError> {
        if self.reject_candidates {
            return Err(StackError::InvalidCandidate("unsupported transport".into()));
        }
        self.log.lock().candidates_added += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), StackError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MediaLog {
    acquired: usize,
    stopped: usize,
}

#[derive(Clone, Default)]
struct MockMedia {
    fail: bool,
    delay: Duration,
    log: Arc<Mutex<MediaLog>>,
}

#[async_trait]
impl MediaSource for MockMedia {
    type Track = String;

    async fn acquire(&self) -> Result<Vec<String>, MediaError> {
        sleep(self.delay).await;
        if self.fail {
            return Err(MediaError::DeviceUnavailable("no camera".into()));
        }
        self.log.lock().acquired += 2;
        Ok(vec!["audio".into(), "video".into()])
    }

    fn stop(&self, _track: &String) {
        self.log.lock().stopped += 1;
    }
}

struct Relay {
    addr: SocketAddr,
    state: RelayState,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = RelayState::new(RelayConfig::default());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let serve_state = state.clone();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        pier_relay::serve(listener, serve_state, shutdown)
            .await
            .unwrap();
    });
    Relay {
        addr,
        state,
        _shutdown: shutdown_tx,
    }
}

fn endpoint(
    relay: &Relay,
    local: &str,
    remote: &str,
    stack: MockStack,
    media: MockMedia,
) -> EndpointHandle {
    let mut config =
        EndpointConfig::new(&format!("ws://{}/ws", relay.addr), local, remote).unwrap();
    config.ice_servers.clear();
    config.reconnect_delay = Duration::from_millis(50);
    config.reconnect_jitter = Duration::ZERO;
    pier_endpoint::spawn(config, stack, media)
}

fn failing_media() -> MockMedia {
    MockMedia {
        fail: true,
        ..MockMedia::default()
    }
}

/// Collects events until `done` returns true for the events seen so far.
async fn events_until(
    handle: &mut EndpointHandle,
    done: impl Fn(&[EndpointEvent]) -> bool,
) -> Vec<EndpointEvent> {
    let mut seen = Vec::new();
    let finished = timeout(Duration::from_secs(10), async {
        while !done(&seen) {
            let event = handle.next_event().await.expect("endpoint stopped");
            seen.push(event);
        }
    })
    .await;
    assert!(finished.is_ok(), "timed out; events so far: {seen:?}");
    seen
}

fn negotiated(events: &[EndpointEvent], role: Role) -> bool {
    events
        .iter()
        .any(|event| matches!(event, EndpointEvent::Negotiated { role: r, .. } if *r == role))
}

fn fully_negotiated(events: &[EndpointEvent]) -> bool {
    negotiated(events, Role::Initiator) && negotiated(events, Role::Responder)
}

async fn wait_for_candidates(stack: &MockStack) {
    timeout(Duration::from_secs(5), async {
        while stack.log.lock().candidates_added == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no remote candidates applied");
}

#[test_timeout::timeout]
async fn paired_endpoints_negotiate_both_directions() {
    let relay = start_relay().await;
    let (stack_a, stack_b) = (MockStack::default(), MockStack::default());
    let media_a = MockMedia::default();
    let mut a = endpoint(&relay, "a", "b", stack_a.clone(), media_a.clone());
    let mut b = endpoint(&relay, "b", "a", stack_b.clone(), MockMedia::default());

    let events_a = events_until(&mut a, fully_negotiated).await;
    let events_b = events_until(&mut b, fully_negotiated).await;

    for events in [&events_a, &events_b] {
        assert!(events.iter().any(|event| matches!(
            event,
            EndpointEvent::RemoteTrack {
                role: Role::Responder,
                ..
            }
        )));
        assert!(!events
            .iter()
            .any(|event| matches!(event, EndpointEvent::Failure(_))));
    }
    wait_for_candidates(&stack_a).await;
    wait_for_candidates(&stack_b).await;
    for stack in [&stack_a, &stack_b] {
        let log = stack.log.lock();
        assert_eq!(log.links, 2, "one connection per role");
        assert_eq!(log.tracks_added, 2, "media attached to the initiator only");
    }

    a.shutdown().await;
    b.shutdown().await;
    let media = media_a.log.lock();
    assert_eq!(media.acquired, 2);
    assert_eq!(media.stopped, 2, "local tracks stopped on shutdown");
}

#[test_timeout::timeout]
async fn shutdown_stops_remote_media_on_the_peer() {
    let relay = start_relay().await;
    let mut a = endpoint(&relay, "a", "b", MockStack::default(), MockMedia::default());
    let mut b = endpoint(&relay, "b", "a", MockStack::default(), MockMedia::default());
    events_until(&mut a, fully_negotiated).await;
    events_until(&mut b, fully_negotiated).await;

    a.shutdown().await;

    events_until(&mut b, |events| {
        events
            .iter()
            .any(|event| matches!(event, EndpointEvent::RemoteMediaStopped))
    })
    .await;
    b.shutdown().await;
}

#[test_timeout::timeout]
async fn responder_answers_without_local_media() {
    let relay = start_relay().await;
    let mut a = endpoint(&relay, "a", "b", MockStack::default(), failing_media());
    let mut b = endpoint(&relay, "b", "a", MockStack::default(), MockMedia::default());

    let events_a = events_until(&mut a, |events| {
        negotiated(events, Role::Responder)
            && events.iter().any(|event| {
                matches!(event, EndpointEvent::Failure(NegotiationError::Media(_)))
            })
    })
    .await;
    assert!(!negotiated(&events_a, Role::Initiator));
    events_until(&mut b, |events| negotiated(events, Role::Initiator)).await;

    a.shutdown().await;
    b.shutdown().await;
}

fn failure(events: &[EndpointEvent]) -> Option<&NegotiationError> {
    events.iter().find_map(|event| match event {
        EndpointEvent::Failure(err) => Some(err),
        _ => None,
    })
}

#[test_timeout::timeout]
async fn rejected_remote_candidates_are_reported() {
    let relay = start_relay().await;
    let mut a = endpoint(
        &relay,
        "a",
        "b",
        MockStack::rejecting_candidates(),
        MockMedia::default(),
    );
    let mut b = endpoint(&relay, "b", "a", MockStack::default(), MockMedia::default());

    let events_a = events_until(&mut a, |events| failure(events).is_some()).await;
    match failure(&events_a) {
        Some(NegotiationError::Stack { message, .. }) => {
            assert!(message.contains("unsupported transport"), "{message}");
        }
        other => panic!("expected a stack failure, got {other:?}"),
    }
    events_until(&mut b, fully_negotiated).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[test_timeout::timeout]
async fn shutdown_during_capture_leaves_no_running_tracks() {
    let relay = start_relay().await;
    let slow = MockMedia {
        delay: Duration::from_millis(300),
        ..MockMedia::default()
    };
    let a = endpoint(&relay, "a", "b", MockStack::default(), slow.clone());
    let b = endpoint(&relay, "b", "a", MockStack::default(), MockMedia::default());

    timeout(Duration::from_secs(5), async {
        while relay.state.registry().len() != 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("endpoints did not register");
    sleep(Duration::from_millis(50)).await;

    a.shutdown().await;
    sleep(Duration::from_millis(500)).await;

    let log = slow.log.lock();
    assert_eq!(log.acquired, log.stopped, "acquired tracks must be stopped");
    drop(log);
    b.shutdown().await;
}
