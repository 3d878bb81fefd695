//! Test-Doubles für Provider, Handles und Capture

use crate::media::{
    CaptureError, MediaCapture, MediaConstraints, MediaStream, MediaTrack, TrackKind,
};
use crate::peer::{
    BoxedCall, BoxedData, CallHandle, CallSignal, DataHandle, PeerError, PeerEvent, PeerProvider,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// RECORDER
// ============================================================================

/// Gemeinsames Protokoll aller Fakes eines Tests
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    events: mpsc::UnboundedSender<PeerEvent>,
    dials: Mutex<Vec<String>>,
    connects: Mutex<Vec<String>>,
    sent: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
    answered: Mutex<Vec<(String, String)>>,
    signals: Mutex<HashMap<String, mpsc::UnboundedSender<CallSignal>>>,
    inbound: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl Recorder {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn signal(&self, connection_id: &str, signal: CallSignal) {
        if let Some(tx) = self.inner.signals.lock().get(connection_id) {
            let _ = tx.send(signal);
        }
    }

    pub fn inbound(&self, connection_id: &str, text: &str) {
        if let Some(tx) = self.inner.inbound.lock().get(connection_id) {
            let _ = tx.send(text.to_string());
        }
    }

    /// Simuliert das Schließen eines Datenkanals durch die Gegenseite
    pub fn close_inbound(&self, connection_id: &str) {
        self.inner.inbound.lock().remove(connection_id);
    }

    pub fn dials(&self) -> Vec<String> {
        self.inner.dials.lock().clone()
    }

    pub fn connects(&self) -> Vec<String> {
        self.inner.connects.lock().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.inner.sent.lock().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.inner.closed.lock().clone()
    }

    /// (connection id, lokale stream id)
    pub fn answered(&self) -> Vec<(String, String)> {
        self.inner.answered.lock().clone()
    }
}

// ============================================================================
// PROVIDER
// ============================================================================

pub struct FakeProvider {
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    recorder: Recorder,
    counter: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> (Self, Recorder) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Recorder {
            inner: Arc::new(RecorderInner {
                events: tx,
                dials: Mutex::new(Vec::new()),
                connects: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
                answered: Mutex::new(Vec::new()),
                signals: Mutex::new(HashMap::new()),
                inbound: Mutex::new(HashMap::new()),
            }),
        };

        let provider = Self {
            events: Some(rx),
            recorder: recorder.clone(),
            counter: AtomicUsize::new(0),
        };
        (provider, recorder)
    }
}

#[async_trait]
impl PeerProvider for FakeProvider {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.take()
    }

    fn id(&self) -> Option<String> {
        None
    }

    async fn call(&self, target: &str, _stream: &MediaStream) -> Result<BoxedCall, PeerError> {
        self.recorder.inner.dials.lock().push(target.to_string());
        if target.trim().is_empty() {
            return Err(PeerError::InvalidTarget(target.to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeCall::incoming(
            &format!("mc_{}", n),
            target,
            &self.recorder,
        )))
    }

    async fn connect(&self, target: &str) -> Result<BoxedData, PeerError> {
        self.recorder.inner.connects.lock().push(target.to_string());
        let n = self.counter.load(Ordering::SeqCst);
        Ok(Box::new(FakeData::incoming(
            &format!("dc_{}", n),
            target,
            &self.recorder,
        )))
    }

    async fn destroy(&self) {}
}

// ============================================================================
// CALL
// ============================================================================

#[derive(Debug)]
pub struct FakeCall {
    id: String,
    peer: String,
    signals: Option<mpsc::UnboundedReceiver<CallSignal>>,
    fail_answer: bool,
    recorder: Recorder,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Recorder")
    }
}

impl FakeCall {
    pub fn incoming(id: &str, peer: &str, recorder: &Recorder) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        recorder.inner.signals.lock().insert(id.to_string(), tx);

        Self {
            id: id.to_string(),
            peer: peer.to_string(),
            signals: Some(rx),
            fail_answer: false,
            recorder: recorder.clone(),
        }
    }

    pub fn failing_answer(mut self) -> Self {
        self.fail_answer = true;
        self
    }
}

#[async_trait]
impl CallHandle for FakeCall {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn take_signals(&mut self) -> Option<mpsc::UnboundedReceiver<CallSignal>> {
        self.signals.take()
    }

    async fn answer(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        if self.fail_answer {
            return Err(PeerError::Closed(self.id.clone()));
        }
        self.recorder
            .inner
            .answered
            .lock()
            .push((self.id.clone(), stream.id().to_string()));
        Ok(())
    }

    fn close(&mut self) {
        self.recorder.inner.closed.lock().push(self.id.clone());
        self.recorder.inner.signals.lock().remove(&self.id);
    }
}

// ============================================================================
// DATA
// ============================================================================

#[derive(Debug)]
pub struct FakeData {
    id: String,
    peer: String,
    incoming: Option<mpsc::UnboundedReceiver<String>>,
    recorder: Recorder,
}

impl FakeData {
    pub fn incoming(id: &str, peer: &str, recorder: &Recorder) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        recorder.inner.inbound.lock().insert(id.to_string(), tx);

        Self {
            id: id.to_string(),
            peer: peer.to_string(),
            incoming: Some(rx),
            recorder: recorder.clone(),
        }
    }
}

#[async_trait]
impl DataHandle for FakeData {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn take_incoming(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.incoming.take()
    }

    async fn send(&self, text: &str) -> Result<(), PeerError> {
        self.recorder.inner.sent.lock().push(text.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.recorder.inner.closed.lock().push(self.id.clone());
        self.recorder.inner.inbound.lock().remove(&self.id);
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Liefert Streams ohne Geräte und zählt die Anfragen
#[derive(Clone, Default)]
pub struct FakeCapture {
    invocations: Arc<AtomicUsize>,
    deny: Arc<AtomicBool>,
    streams: Arc<Mutex<Vec<MediaStream>>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Alle bisher ausgegebenen Streams
    pub fn streams(&self) -> Vec<MediaStream> {
        self.streams.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn get_user_media(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<MediaStream, CaptureError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(CaptureError::Device("permission denied".to_string()));
        }

        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "fake mic"),
            MediaTrack::new(TrackKind::Video, "fake cam"),
        ]);
        self.streams.lock().push(stream.clone());
        Ok(stream)
    }
}
