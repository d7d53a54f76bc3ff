//! Live voice session lifecycle
//!
//! A [`SessionController`] owns at most one running session. Everything that
//! can change session state (captured frames, transport events, playback
//! completions and visualizer ticks) is funneled into a single queue and
//! handled by the session task in arrival order.

mod transmit;

pub use transmit::TransmitChannel;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::transport::{Connection, Connector, Transport, TransportEvent};
use crate::voice::{
    AudioFrame, AudioHost, CaptureControl, CaptureLoop, InputDevice, PlaybackId, PlaybackScheduler,
    SPEAKING_EPSILON, VisualizerSampler, VolumeSample, codec,
};
use crate::{Error, Result};

/// Connection state of the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of everything a UI needs to render the session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Whether remote speech is queued or playing
    pub remote_speaking: bool,
    /// Latest microphone volume
    pub volume: VolumeSample,
    /// Message of the error that ended the last session
    pub error: Option<String>,
}

/// Starts and stops live voice sessions
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    host: Arc<dyn AudioHost>,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    status: StatusPublisher,
    active: Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSession {
    /// Cancel the session task and wait until it has released everything
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(session = %self.id, error = %e, "session task panicked");
            }
        }
    }
}

impl SessionController {
    #[must_use]
    pub fn new(
        host: Arc<dyn AudioHost>,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            inner: Arc::new(Inner {
                host,
                connector,
                config,
                status: StatusPublisher(Arc::new(status)),
                active: Mutex::new(None),
            }),
        }
    }

    /// Start a session, replacing any session already running
    ///
    /// Resolves once the remote has opened the conversation and microphone
    /// frames are flowing.
    ///
    /// # Errors
    ///
    /// Returns `Permission` if the microphone cannot be acquired, `Connection`
    /// if the transport cannot be opened, or `Cancelled` if [`Self::stop`] ran
    /// first. Every acquired resource has been released when an error is
    /// returned.
    pub async fn start(&self) -> Result<()> {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        {
            let mut active = self.inner.active.lock().await;
            if let Some(previous) = active.take() {
                tracing::info!(session = %previous.id, "replacing active session");
                previous.shutdown().await;
            }

            self.inner.status.begin();
            let session = SessionTask {
                host: Arc::clone(&self.inner.host),
                connector: Arc::clone(&self.inner.connector),
                config: self.inner.config,
                status: self.inner.status.clone(),
                cancel: cancel.clone(),
            };
            let span = tracing::info_span!("session", id = %id);
            let task = tokio::spawn(session.run(ready_tx).instrument(span));
            *active = Some(ActiveSession { id, cancel, task });
        }

        let result = ready_rx.await.unwrap_or(Err(Error::Cancelled));
        if let Err(e) = &result {
            tracing::warn!(session = %id, error = %e, "session failed to start");

            let mut active = self.inner.active.lock().await;
            if active.as_ref().is_some_and(|session| session.id == id) {
                if let Some(session) = active.take() {
                    session.shutdown().await;
                }
            }
        }
        result
    }

    /// Stop the current session and release every resource it holds
    ///
    /// Safe to call in any state and any number of times; returns once
    /// teardown has finished.
    pub async fn stop(&self) {
        let mut active = self.inner.active.lock().await;
        if let Some(session) = active.take() {
            tracing::info!(session = %session.id, "stopping session");
            session.shutdown().await;
        }
        self.inner.status.disconnected();
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.status.0.borrow().state
    }

    /// Latest status snapshot
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.inner.status.0.borrow().clone()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.0.subscribe()
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("config", &self.inner.config)
            .field("status", &*self.inner.status.0.borrow())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct StatusPublisher(Arc<watch::Sender<SessionStatus>>);

impl StatusPublisher {
    fn begin(&self) {
        self.0.send_modify(|status| {
            status.state = SessionState::Connecting;
            status.remote_speaking = false;
            status.error = None;
        });
    }

    fn connected(&self) {
        self.0.send_modify(|status| status.state = SessionState::Connected);
    }

    fn disconnected(&self) {
        self.0.send_if_modified(|status| {
            let changed = status.state != SessionState::Disconnected
                || status.remote_speaking
                || status.volume != VolumeSample::SILENT;
            status.state = SessionState::Disconnected;
            status.remote_speaking = false;
            status.volume = VolumeSample::SILENT;
            changed
        });
    }

    fn fail(&self, error: &Error) {
        let message = error.to_string();
        self.0.send_modify(|status| {
            status.state = SessionState::Error;
            status.remote_speaking = false;
            status.volume = VolumeSample::SILENT;
            status.error = Some(message);
        });
    }

    fn is_speaking(&self) -> bool {
        self.0.borrow().remote_speaking
    }

    fn set_speaking(&self, speaking: bool) {
        self.0.send_if_modified(|status| {
            if status.remote_speaking == speaking {
                return false;
            }
            status.remote_speaking = speaking;
            true
        });
    }

    fn set_volume(&self, volume: VolumeSample) {
        self.0.send_if_modified(|status| {
            if status.volume == volume {
                return false;
            }
            status.volume = volume;
            true
        });
    }
}

/// Everything the session task reacts to
enum SessionEvent {
    Captured(AudioFrame),
    Transport(TransportEvent),
    PlaybackFinished(PlaybackId),
    Tick,
    TransmitFailed(Error),
}

/// Why the session loop ended
enum Exit {
    /// Local stop request
    Stopped,
    /// Remote closed an open conversation
    Closed(Option<String>),
    Failed(Error),
}

/// Resources held by a running session, released in field order
#[derive(Default)]
struct Resources {
    input: Option<Box<dyn InputDevice>>,
    capture: Option<CaptureControl>,
    visualizer: Option<VisualizerSampler>,
    playback: Option<PlaybackScheduler>,
    transmit: Option<TransmitChannel>,
    transport: Option<Arc<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
}

impl Resources {
    async fn release(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.pause();
        }
        if let Some(mut input) = self.input.take() {
            input.close();
            tracing::debug!("microphone released");
        }
        if let Some(visualizer) = self.visualizer.take() {
            visualizer.stop().await;
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
            tracing::debug!("speaker released");
        }
        if let Some(transmit) = self.transmit.take() {
            let sent = transmit.sent();
            transmit.shutdown().await;
            tracing::debug!(sent, "transmit channel closed");
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            tracing::debug!("transport closed");
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct SessionTask {
    host: Arc<dyn AudioHost>,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    status: StatusPublisher,
    cancel: CancellationToken,
}

type ReadySender = oneshot::Sender<Result<()>>;

impl SessionTask {
    async fn run(self, ready: ReadySender) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut ready = Some(ready);
        let mut resources = Resources::default();

        let exit = match self.acquire(&mut resources, &events_tx).await {
            Ok(()) => self.drive(&mut resources, events_rx, &mut ready).await,
            Err(exit) => exit,
        };
        drop(events_tx);
        resources.release().await;

        match exit {
            Exit::Stopped => {
                tracing::info!("session stopped");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(Error::Cancelled));
                }
            }
            Exit::Closed(reason) => {
                tracing::info!(reason = reason.as_deref().unwrap_or("none"), "remote closed session");
                self.status.disconnected();
            }
            Exit::Failed(e) => {
                tracing::error!(error = %e, "session failed");
                self.status.fail(&e);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                }
            }
        }
    }

    /// Acquire microphone, speaker and transport, in that order
    async fn acquire(
        &self,
        resources: &mut Resources,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> std::result::Result<(), Exit> {
        let config = self.config;

        let frames = events.clone();
        let (capture, control) = CaptureLoop::new(
            config.frame_size,
            config.input_sample_rate,
            Box::new(move |frame: AudioFrame| {
                let _ = frames.send(SessionEvent::Captured(frame));
            }),
        );
        let input = self
            .host
            .open_input(config.input_sample_rate, capture.into_sink())
            .map_err(Exit::Failed)?;
        resources.input = Some(input);
        tracing::debug!(sample_rate = config.input_sample_rate, "microphone acquired");

        let ticks = events.clone();
        let status = self.status.clone();
        resources.visualizer = Some(VisualizerSampler::spawn(
            control.analysis(),
            config.visualizer_interval,
            config.fft_size,
            self.cancel.child_token(),
            move |volume| {
                status.set_volume(volume);
                let _ = ticks.send(SessionEvent::Tick);
            },
        ));
        resources.capture = Some(control);

        let finished = events.clone();
        let output = self
            .host
            .open_output(
                config.output_sample_rate,
                Box::new(move |id: PlaybackId| {
                    let _ = finished.send(SessionEvent::PlaybackFinished(id));
                }),
            )
            .map_err(Exit::Failed)?;
        resources.playback = Some(PlaybackScheduler::new(output, config.safety_margin));
        tracing::debug!(sample_rate = config.output_sample_rate, "speaker acquired");

        let connection = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Exit::Stopped),
            result = self.connector.connect() => result.map_err(|e| Exit::Failed(connection_error(e)))?,
        };
        let Connection {
            transport,
            events: mut remote,
        } = connection;

        let failures = events.clone();
        resources.transmit = Some(TransmitChannel::spawn(Arc::clone(&transport), move |e| {
            let _ = failures.send(SessionEvent::TransmitFailed(e));
        }));
        resources.transport = Some(transport);

        let inbound = events.clone();
        resources.pump = Some(tokio::spawn(async move {
            while let Some(event) = remote.recv().await {
                if inbound.send(SessionEvent::Transport(event)).is_err() {
                    return;
                }
            }
            let _ = inbound.send(SessionEvent::Transport(TransportEvent::Closed {
                reason: Some("event stream ended".to_string()),
            }));
        }));

        tracing::debug!("transport connected, waiting for remote");
        Ok(())
    }

    /// Handle queued events until the session ends
    async fn drive(
        &self,
        resources: &mut Resources,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        ready: &mut Option<ReadySender>,
    ) -> Exit {
        let (Some(capture), Some(playback), Some(transmit)) = (
            resources.capture.as_ref(),
            resources.playback.as_mut(),
            resources.transmit.as_ref(),
        ) else {
            return Exit::Failed(Error::Audio("session resources incomplete".to_string()));
        };

        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Exit::Stopped,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return Exit::Closed(None),
                },
            };

            match event {
                SessionEvent::Captured(frame) => {
                    if !transmit.push(codec::encode(frame.samples())) {
                        tracing::debug!("transmit channel closed, dropping frame");
                    }
                }
                SessionEvent::Transport(event) => {
                    if let Some(exit) = self.on_transport(event, capture, playback, ready) {
                        return exit;
                    }
                }
                SessionEvent::PlaybackFinished(id) => {
                    playback.complete(id);
                    self.refresh_speaking(playback);
                }
                SessionEvent::Tick => self.refresh_speaking(playback),
                SessionEvent::TransmitFailed(e) => return Exit::Failed(e),
            }
        }
    }

    fn on_transport(
        &self,
        event: TransportEvent,
        capture: &CaptureControl,
        playback: &mut PlaybackScheduler,
        ready: &mut Option<ReadySender>,
    ) -> Option<Exit> {
        tracing::trace!(kind = event.kind(), "transport event");

        match event {
            TransportEvent::Opened => {
                let Some(ready) = ready.take() else {
                    tracing::debug!("ignoring repeated open");
                    return None;
                };
                self.status.connected();
                capture.begin();
                tracing::info!("session connected");
                let _ = ready.send(Ok(()));
                None
            }
            TransportEvent::AudioChunk { data, sample_rate } => {
                match codec::decode(&data, sample_rate).and_then(|frame| playback.enqueue(&frame)) {
                    Ok(Some(_)) => {
                        self.status.set_speaking(true);
                        None
                    }
                    Ok(None) => None,
                    Err(e) if !e.is_fatal() => {
                        tracing::warn!(error = %e, bytes = data.len(), "dropping audio frame");
                        None
                    }
                    Err(e) => Some(Exit::Failed(e)),
                }
            }
            TransportEvent::Interrupted => {
                let stopped = playback.flush();
                tracing::info!(stopped, "remote interrupted");
                self.status.set_speaking(false);
                None
            }
            TransportEvent::TurnComplete => {
                tracing::debug!("remote turn complete");
                match playback.finish_turn() {
                    Ok(Some(_)) => {
                        self.status.set_speaking(true);
                        None
                    }
                    Ok(None) => None,
                    Err(e) if !e.is_fatal() => {
                        tracing::warn!(error = %e, "dropping held audio");
                        None
                    }
                    Err(e) => Some(Exit::Failed(e)),
                }
            }
            TransportEvent::Closed { reason } => {
                if ready.is_some() {
                    let reason = reason.unwrap_or_else(|| "no reason given".to_string());
                    return Some(Exit::Failed(Error::Connection(format!(
                        "closed before opening: {reason}"
                    ))));
                }
                Some(Exit::Closed(reason))
            }
            TransportEvent::Error(message) => {
                if ready.is_some() {
                    return Some(Exit::Failed(Error::Connection(message)));
                }
                Some(Exit::Failed(Error::Transport(message)))
            }
        }
    }

    fn refresh_speaking(&self, playback: &PlaybackScheduler) {
        if self.status.is_speaking() && playback.is_caught_up(SPEAKING_EPSILON) {
            self.status.set_speaking(false);
        }
    }
}

fn connection_error(error: Error) -> Error {
    match error {
        Error::Connection(_) => error,
        other => Error::Connection(other.to_string()),
    }
}
