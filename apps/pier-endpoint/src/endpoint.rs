use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use pier_proto::{SessionDescription, SessionToken};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::error::StackError;
use crate::machine::{Action, EndpointEvent, Input, LinkCommand, LinkOutcome, Negotiator, Role};
use crate::signaling::{SignalingClient, SignalingConfig, SignalingEvent};
use crate::stack::{LinkEvents, MediaSource, PeerLink, PeerStack, TaggedLinkEvent};

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running endpoint. Dropping it stops the endpoint.
pub struct EndpointHandle {
    events: mpsc::UnboundedReceiver<EndpointEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl EndpointHandle {
    pub async fn next_event(&mut self) -> Option<EndpointEvent> {
        self.events.recv().await
    }

    /// Closes the relay channel and both peer connections, then stops capture.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = (&mut self.task).await {
            warn!(error = %err, "endpoint task ended abnormally");
        }
    }
}

/// Starts an endpoint: connects to the relay and negotiates with whoever
/// registers the reverse identifier pair.
pub fn spawn<S, M>(config: EndpointConfig, stack: S, media: M) -> EndpointHandle
where
    S: PeerStack,
    M: MediaSource<Track = S::Track>,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run(
        config,
        Arc::new(stack),
        Arc::new(media),
        events_tx,
        shutdown_rx,
    ));
    EndpointHandle {
        events: events_rx,
        shutdown: Some(shutdown_tx),
        task,
    }
}

struct Driver<S: PeerStack, M: MediaSource<Track = S::Track>> {
    config: EndpointConfig,
    media: Arc<M>,
    tracks: Arc<Mutex<Vec<S::Track>>>,
    signaling: Arc<SignalingClient>,
    initiator: RoleWorker,
    responder: RoleWorker,
    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    /// Capture and answer-timer tasks; joined on stop.
    tasks: Vec<JoinHandle<()>>,
}

async fn run<S, M>(
    config: EndpointConfig,
    stack: Arc<S>,
    media: Arc<M>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    mut shutdown: oneshot::Receiver<()>,
) where
    S: PeerStack,
    M: MediaSource<Track = S::Track>,
{
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    let (link_tx, mut link_rx) = mpsc::unbounded_channel();
    let tracks = Arc::new(Mutex::new(Vec::new()));

    info!(
        relay = %config.relay_url,
        local = %config.negotiator.local,
        remote = %config.negotiator.remote,
        "starting endpoint"
    );
    let signaling = SignalingClient::start(SignalingConfig::from(&config), signal_tx);
    let ice_servers: Arc<[String]> = config.ice_servers.clone().into();
    let worker = |role| {
        RoleWorker::spawn(
            role,
            Arc::clone(&stack),
            Arc::clone(&ice_servers),
            Arc::clone(&tracks),
            input_tx.clone(),
            link_tx.clone(),
        )
    };
    let initiator = worker(Role::Initiator);
    let responder = worker(Role::Responder);

    let mut negotiator = Negotiator::new(config.negotiator.clone());
    let mut driver: Driver<S, M> = Driver {
        config,
        media,
        tracks: Arc::clone(&tracks),
        signaling,
        initiator,
        responder,
        inputs: input_tx,
        events,
        tasks: Vec::new(),
    };

    loop {
        let input = tokio::select! {
            _ = &mut shutdown => break,
            Some(event) = signal_rx.recv() => match event {
                SignalingEvent::Connected => Input::SignalingOpened,
                SignalingEvent::Envelope(envelope) => Input::Signal(envelope),
                SignalingEvent::Disconnected => continue,
            },
            Some(input) = input_rx.recv() => input,
            Some(tagged) = link_rx.recv() => Input::Link(tagged),
        };
        for action in negotiator.handle(input) {
            driver.execute(action);
        }
    }

    driver.stop().await;
}

impl<S, M> Driver<S, M>
where
    S: PeerStack,
    M: MediaSource<Track = S::Track>,
{
    fn execute(&mut self, action: Action) {
        match action {
            Action::Send(envelope) => {
                let kind = envelope.kind();
                if let Err(err) = self.signaling.send(envelope) {
                    debug!(kind, error = %err, "dropping outbound envelope");
                }
            }
            Action::Link {
                role,
                token,
                command,
            } => self.worker(role).submit(token, command),
            Action::AcquireMedia => self.acquire_media(),
            Action::ArmAnswerTimeout { token, after } => self.arm_answer_timeout(token, after),
            Action::Emit(event) => {
                if let EndpointEvent::Failure(err) = &event {
                    warn!(error = %err, "negotiation failure");
                }
                let _ = self.events.send(event);
            }
        }
    }

    fn worker(&self, role: Role) -> &RoleWorker {
        match role {
            Role::Initiator => &self.initiator,
            Role::Responder => &self.responder,
        }
    }

    fn acquire_media(&mut self) {
        let media = Arc::clone(&self.media);
        let tracks = Arc::clone(&self.tracks);
        let inputs = self.inputs.clone();
        self.track_task(tokio::spawn(async move {
            let input = match media.acquire().await {
                Ok(acquired) => {
                    info!(tracks = acquired.len(), "local media ready");
                    let previous = std::mem::replace(&mut *tracks.lock(), acquired);
                    for track in &previous {
                        media.stop(track);
                    }
                    Input::MediaReady
                }
                Err(err) => Input::MediaFailed(err.to_string()),
            };
            let _ = inputs.send(input);
        }));
    }

    fn arm_answer_timeout(&mut self, token: SessionToken, after: Duration) {
        let inputs = self.inputs.clone();
        self.track_task(tokio::spawn(async move {
            sleep(after).await;
            let _ = inputs.send(Input::AnswerTimeout { token });
        }));
    }

    fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(task);
    }

    async fn stop(mut self) {
        info!(local = %self.config.negotiator.local, "stopping endpoint");
        self.signaling.shutdown();
        // A capture still in flight must not publish tracks after the drain below.
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        for worker in [self.initiator, self.responder] {
            worker.stop().await;
        }
        for track in self.tracks.lock().drain(..) {
            self.media.stop(&track);
        }
    }
}

/// Serializes one role's peer-connection operations.
struct RoleWorker {
    role: Role,
    commands: mpsc::UnboundedSender<(Option<SessionToken>, LinkCommand)>,
    task: JoinHandle<()>,
}

impl RoleWorker {
    fn spawn<S: PeerStack>(
        role: Role,
        stack: Arc<S>,
        ice_servers: Arc<[String]>,
        tracks: Arc<Mutex<Vec<S::Track>>>,
        inputs: mpsc::UnboundedSender<Input>,
        link_events: mpsc::UnboundedSender<TaggedLinkEvent>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(
            role,
            stack,
            ice_servers,
            tracks,
            rx,
            inputs,
            link_events,
        ));
        Self {
            role,
            commands,
            task,
        }
    }

    fn submit(&self, token: Option<SessionToken>, command: LinkCommand) {
        if self.commands.send((token, command)).is_err() {
            warn!(role = %self.role, "peer connection worker is gone");
        }
    }

    async fn stop(self) {
        let RoleWorker { role, commands, task } = self;
        drop(commands);
        match timeout(WORKER_SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%role, error = %err, "peer connection worker failed"),
            Err(_) => warn!(%role, "peer connection worker did not stop in time"),
        }
    }
}

async fn run_worker<S: PeerStack>(
    role: Role,
    stack: Arc<S>,
    ice_servers: Arc<[String]>,
    tracks: Arc<Mutex<Vec<S::Track>>>,
    mut commands: mpsc::UnboundedReceiver<(Option<SessionToken>, LinkCommand)>,
    inputs: mpsc::UnboundedSender<Input>,
    link_events: mpsc::UnboundedSender<TaggedLinkEvent>,
) {
    let mut current: Option<(Option<SessionToken>, S::Link)> = None;

    while let Some((token, command)) = commands.recv().await {
        let outcome = match command {
            LinkCommand::Open { attach_media } => {
                close_link(role, current.take()).await;
                let events = LinkEvents::new(role, token.clone(), link_events.clone());
                let local_tracks = if attach_media {
                    tracks.lock().clone()
                } else {
                    Vec::new()
                };
                match open_link(&*stack, &ice_servers, events, &local_tracks).await {
                    Ok(link) => {
                        debug!(%role, tracks = local_tracks.len(), "peer connection created");
                        current = Some((token.clone(), link));
                        None
                    }
                    Err(err) => Some(LinkOutcome::Failed(err.to_string())),
                }
            }
            LinkCommand::Close => {
                close_link(role, current.take()).await;
                None
            }
            command => {
                let Some((_, link)) = current
                    .as_ref()
                    .filter(|(link_token, _)| link_token == &token)
                else {
                    debug!(%role, "no peer connection for this session; skipping command");
                    continue;
                };
                run_command(role, link, command).await
            }
        };

        if let Some(outcome) = outcome {
            let _ = inputs.send(Input::Completed {
                role,
                token,
                outcome,
            });
        }
    }

    close_link(role, current.take()).await;
}

async fn open_link<S: PeerStack>(
    stack: &S,
    ice_servers: &[String],
    events: LinkEvents,
    tracks: &[S::Track],
) -> Result<S::Link, StackError> {
    let link = stack.connect(ice_servers, events).await?;
    for track in tracks {
        if let Err(err) = link.add_track(track).await {
            let _ = link.close().await;
            return Err(err);
        }
    }
    Ok(link)
}

async fn run_command<L: PeerLink>(role: Role, link: &L, command: LinkCommand) -> Option<LinkOutcome> {
    let result = match command {
        LinkCommand::CreateOffer => describe_local(link, link.create_offer().await).await,
        LinkCommand::CreateAnswer => describe_local(link, link.create_answer().await).await,
        LinkCommand::ApplyRemote(description) => link
            .set_remote_description(description)
            .await
            .map(|()| Some(LinkOutcome::RemoteApplied)),
        LinkCommand::AddCandidates(candidates) => {
            let mut rejected = None;
            for candidate in candidates {
                if let Err(err) = link.add_ice_candidate(candidate).await {
                    warn!(%role, error = %err, "failed to add remote candidate");
                    rejected.get_or_insert(err);
                }
            }
            rejected.map_or(Ok(None), Err)
        }
        LinkCommand::Open { .. } | LinkCommand::Close => Ok(None),
    };
    match result {
        Ok(outcome) => outcome,
        Err(err) => Some(LinkOutcome::Failed(err.to_string())),
    }
}

async fn describe_local<L: PeerLink>(
    link: &L,
    created: Result<SessionDescription, StackError>,
) -> Result<Option<LinkOutcome>, StackError> {
    let description = created?;
    link.set_local_description(description.clone()).await?;
    Ok(Some(LinkOutcome::LocalDescription(description)))
}

async fn close_link<L: PeerLink>(role: Role, link: Option<(Option<SessionToken>, L)>) {
    if let Some((_, link)) = link {
        if let Err(err) = link.close().await {
            debug!(%role, error = %err, "failed to close peer connection");
        }
    }
}
