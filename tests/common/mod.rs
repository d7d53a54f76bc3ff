//! Shared test utilities
//!
//! A fake audio host driven by a manual clock and a scripted connector, so
//! whole sessions can run without audio hardware or a network.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use beacon_live::config::SessionConfig;
use beacon_live::transport::{Connection, Connector, Transport, TransportEvent};
use beacon_live::voice::{codec, AudioHost, InputDevice, InputSink, OutputDevice, PlaybackId, PlaybackNotifier};
use beacon_live::{Error, Result, SessionController};

/// A buffer handed to the fake speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub id: PlaybackId,
    pub start: Duration,
    pub duration: Duration,
}

#[derive(Default)]
struct HostState {
    now: Duration,
    deny_microphone: bool,
    inputs_opened: usize,
    inputs_open: usize,
    outputs_opened: usize,
    outputs_open: usize,
    sink: Option<InputSink>,
    notifier: Option<PlaybackNotifier>,
    scheduled: Vec<Scheduled>,
    pending: Vec<Scheduled>,
    stopped: Vec<PlaybackId>,
}

/// Audio host whose output clock only moves when told to
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next microphone request fail
    pub fn deny_microphone(&self) {
        self.state.lock().unwrap().deny_microphone = true;
    }

    /// Feed samples through the open microphone, if any
    pub fn push_input(&self, samples: &[f32]) {
        let mut state = self.state.lock().unwrap();
        if let Some(sink) = state.sink.as_mut() {
            sink(samples);
        }
    }

    /// Move the output clock forward, reporting buffers that played out
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now += by;
        let now = state.now;

        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|s| s.start + s.duration <= now);
        state.pending = pending;

        if let Some(notify) = state.notifier.as_ref() {
            for scheduled in done {
                notify(scheduled.id);
            }
        }
    }

    pub fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    pub fn scheduled(&self) -> Vec<Scheduled> {
        self.state.lock().unwrap().scheduled.clone()
    }

    /// Buffers neither played out nor stopped
    pub fn pending(&self) -> Vec<Scheduled> {
        self.state.lock().unwrap().pending.clone()
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn inputs_opened(&self) -> usize {
        self.state.lock().unwrap().inputs_opened
    }

    pub fn inputs_open(&self) -> usize {
        self.state.lock().unwrap().inputs_open
    }

    pub fn outputs_opened(&self) -> usize {
        self.state.lock().unwrap().outputs_opened
    }

    pub fn outputs_open(&self) -> usize {
        self.state.lock().unwrap().outputs_open
    }
}

impl AudioHost for FakeHost {
    fn open_input(&self, _sample_rate: u32, sink: InputSink) -> Result<Box<dyn InputDevice>> {
        let mut state = self.state.lock().unwrap();
        if state.deny_microphone {
            return Err(Error::Permission("microphone access denied".to_string()));
        }
        state.inputs_opened += 1;
        state.inputs_open += 1;
        state.sink = Some(sink);
        Ok(Box::new(FakeInput {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        finished: PlaybackNotifier,
    ) -> Result<Box<dyn OutputDevice>> {
        let mut state = self.state.lock().unwrap();
        state.outputs_opened += 1;
        state.outputs_open += 1;
        state.notifier = Some(finished);
        Ok(Box::new(FakeOutput {
            state: Arc::clone(&self.state),
            sample_rate,
            closed: false,
        }))
    }
}

struct FakeInput {
    state: Arc<Mutex<HostState>>,
    closed: bool,
}

impl InputDevice for FakeInput {
    fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.inputs_open -= 1;
        state.sink = None;
    }
}

struct FakeOutput {
    state: Arc<Mutex<HostState>>,
    sample_rate: u32,
    closed: bool,
}

impl OutputDevice for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn schedule(&mut self, id: PlaybackId, samples: Arc<[f32]>, start: Duration) -> Result<()> {
        if self.closed {
            return Err(Error::Audio("output closed".to_string()));
        }
        let duration = codec::samples_to_duration(samples.len(), self.sample_rate);
        let scheduled = Scheduled {
            id,
            start,
            duration,
        };
        let mut state = self.state.lock().unwrap();
        state.scheduled.push(scheduled);
        state.pending.push(scheduled);
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|s| s.id != id);
        state.stopped.push(id);
    }

    fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.outputs_open -= 1;
        state.pending.clear();
        state.notifier = None;
    }
}

/// Connector whose remote side is driven by the test
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    inner: Arc<ConnectorInner>,
}

#[derive(Default)]
struct ConnectorInner {
    connects: AtomicUsize,
    fail_with: Mutex<Option<String>>,
    hold: AtomicBool,
    manual_open: AtomicBool,
    reject_sends: AtomicBool,
    remote: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every connection attempt with `message`
    pub fn fail_with(&self, message: &str) {
        *self.inner.fail_with.lock().unwrap() = Some(message.to_string());
    }

    /// Never finish connecting
    pub fn hold(&self) {
        self.inner.hold.store(true, Ordering::SeqCst);
    }

    /// Wait for [`Self::emit`] of `Opened` instead of opening immediately
    pub fn manual_open(&self) {
        self.inner.manual_open.store(true, Ordering::SeqCst);
    }

    /// Make every outbound frame fail
    pub fn reject_sends(&self) {
        self.inner.reject_sends.store(true, Ordering::SeqCst);
    }

    /// Deliver an event from the remote side
    pub fn emit(&self, event: TransportEvent) {
        if let Some(remote) = self.inner.remote.lock().unwrap().as_ref() {
            let _ = remote.send(event);
        }
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Connection> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        if self.inner.hold.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(message) = self.inner.fail_with.lock().unwrap().clone() {
            return Err(Error::Connection(message));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if !self.inner.manual_open.load(Ordering::SeqCst) {
            let _ = tx.send(TransportEvent::Opened);
        }
        *self.inner.remote.lock().unwrap() = Some(tx);

        let transport = ScriptedTransport {
            sent: Arc::clone(&self.inner.sent),
            closes: Arc::clone(&self.inner.closes),
            reject: self.inner.reject_sends.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        };
        Ok(Connection {
            transport: Arc::new(transport),
            events: rx,
        })
    }
}

struct ScriptedTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    closes: Arc<AtomicUsize>,
    reject: bool,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.reject || self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection reset".to_string()));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Controller wired to fresh fakes
pub fn controller() -> (SessionController, FakeHost, ScriptedConnector) {
    let host = FakeHost::new();
    let connector = ScriptedConnector::new();
    let controller = SessionController::new(
        Arc::new(host.clone()),
        Arc::new(connector.clone()),
        SessionConfig::default(),
    );
    (controller, host, connector)
}

/// Little-endian PCM16 bytes holding `samples` copies of `value`
pub fn pcm(samples: usize, value: i16) -> Vec<u8> {
    std::iter::repeat_n(value.to_le_bytes(), samples)
        .flatten()
        .collect()
}

/// 100 ms of speech at 24 kHz
pub fn speech_chunk() -> TransportEvent {
    TransportEvent::AudioChunk {
        data: pcm(2400, 8000),
        sample_rate: 24_000,
    }
}

/// 200 ms of speech at 24 kHz
pub fn long_speech_chunk() -> TransportEvent {
    TransportEvent::AudioChunk {
        data: pcm(4800, 8000),
        sample_rate: 24_000,
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Await `future`, failing the test after two seconds
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation timed out")
}
