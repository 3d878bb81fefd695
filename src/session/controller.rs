//! Video Chat Session Controller
//!
//! Koordiniert genau eine Anruf-Session mit dem Peer Provider:
//! - Anruf starten, annehmen, ablehnen, beenden
//! - Lokale Tracks an/aus schalten
//! - Text-Chat über den Datenkanal
//!
//! Der Controller gehört exklusiv dem Dispatch-Task der UI. Alle Mutationen
//! laufen über `&mut self`; Provider-Callbacks schreiben nie direkt in den
//! Zustand, sondern landen als `SessionEvent` in der eigenen Queue.

use super::chat::{ChatLog, ChatMessage};
use super::surface::{RenderTarget, VideoSurface};
use crate::media::{CaptureError, MediaCapture, MediaConstraints, MediaStream, TrackKind};
use crate::peer::{BoxedCall, BoxedData, CallSignal, PeerError, PeerEvent, PeerProvider};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to get local stream: {0}")]
    Capture(#[from] CaptureError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No data connection")]
    NoDataConnection,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Genau einer der drei Zustände ist aktiv; während `answer` gibt es keine
/// doppelte Referenz auf den Anruf.
enum CallState {
    Idle,
    PendingIncoming(BoxedCall),
    Active(BoxedCall),
}

impl CallState {
    fn call(&self) -> Option<&BoxedCall> {
        match self {
            CallState::Idle => None,
            CallState::PendingIncoming(call) | CallState::Active(call) => Some(call),
        }
    }
}

/// Öffentliche Sicht auf den Anruf-Zustand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Ringing,
    InCall,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Alles was asynchron beim Controller ankommt
#[derive(Debug)]
pub enum SessionEvent {
    Peer(PeerEvent),
    Call {
        connection_id: String,
        signal: CallSignal,
    },
    Message {
        connection_id: String,
        text: String,
    },
    DataClosed {
        connection_id: String,
    },
}

/// Ergebnis eines verarbeiteten Events, für die Darstellung
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Identity(String),
    IncomingCall { peer: String },
    RemoteStream { stream_id: String },
    CallClosed,
    DataConnected { peer: String },
    DataClosed,
    Message(ChatMessage),
    ProviderDisconnected,
    ProviderError(String),
}

// ============================================================================
// VIDEO CHAT
// ============================================================================

pub struct VideoChat {
    provider: Box<dyn PeerProvider>,
    capture: Box<dyn MediaCapture>,
    constraints: MediaConstraints,

    state: CallState,
    local_stream: Option<MediaStream>,
    data: Option<BoxedData>,

    local_view: Box<dyn RenderTarget>,
    remote_view: Box<dyn RenderTarget>,

    peer_id: Option<String>,
    chat: ChatLog,
    draft: String,
    video_enabled: bool,
    audio_enabled: bool,

    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl VideoChat {
    /// Erstellt einen Controller mit einfachen Render Targets
    pub fn new(mut provider: Box<dyn PeerProvider>, capture: Box<dyn MediaCapture>) -> Self {
        let peer_events = provider.take_events();
        if peer_events.is_none() {
            tracing::warn!("Peer provider events already taken, no incoming calls will be seen");
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            peer_id: provider.id(),
            provider,
            capture,
            constraints: MediaConstraints::default(),
            state: CallState::Idle,
            local_stream: None,
            data: None,
            local_view: Box::new(VideoSurface::new()),
            remote_view: Box::new(VideoSurface::new()),
            chat: ChatLog::new(),
            draft: String::new(),
            video_enabled: true,
            audio_enabled: true,
            peer_events,
            event_tx,
            event_rx,
        }
    }

    /// Ersetzt die Render Targets für lokale Vorschau und Remote-Video
    pub fn with_views(
        mut self,
        local: Box<dyn RenderTarget>,
        remote: Box<dyn RenderTarget>,
    ) -> Self {
        self.local_view = local;
        self.remote_view = remote;
        self
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn status(&self) -> CallStatus {
        match self.state {
            CallState::Idle => CallStatus::Idle,
            CallState::PendingIncoming(_) => CallStatus::Ringing,
            CallState::Active(_) => CallStatus::InCall,
        }
    }

    /// Gegenstelle des aktuellen (oder klingelnden) Anrufs
    pub fn remote_peer(&self) -> Option<&str> {
        self.state.call().map(|call| call.peer())
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn local_view(&self) -> &dyn RenderTarget {
        self.local_view.as_ref()
    }

    pub fn remote_view(&self) -> &dyn RenderTarget {
        self.remote_view.as_ref()
    }

    pub fn has_data_connection(&self) -> bool {
        self.data.is_some()
    }

    pub fn messages(&self) -> &ChatLog {
        &self.chat
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    // ========================================================================
    // CALL LIFECYCLE
    // ========================================================================

    /// Startet einen ausgehenden Anruf inklusive Datenkanal.
    ///
    /// `target` wird nicht validiert; der Provider entscheidet.
    pub async fn place_call(&mut self, target: &str) -> Result<(), SessionError> {
        if !matches!(self.state, CallState::Idle) {
            return Err(SessionError::AlreadyInCall);
        }

        tracing::info!("Calling {:?}...", target);
        let stream = self.acquire_local().await?;

        let mut call = match self.provider.call(target, &stream).await {
            Ok(call) => call,
            Err(e) => {
                self.release_local();
                return Err(e.into());
            }
        };
        self.watch_call(&mut call);
        self.state = CallState::Active(call);

        let data = self.provider.connect(target).await?;
        self.install_data(data);

        Ok(())
    }

    /// Nimmt den klingelnden Anruf an. Ohne klingelnden Anruf passiert nichts.
    pub async fn answer(&mut self) -> Result<(), SessionError> {
        let mut call = match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::PendingIncoming(call) => call,
            other => {
                self.state = other;
                tracing::debug!("answer: no incoming call");
                return Ok(());
            }
        };

        // Bei Capture-Fehler klingelt der Anruf weiter
        let stream = match self.acquire_local().await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = CallState::PendingIncoming(call);
                return Err(e);
            }
        };

        if let Err(e) = call.answer(&stream).await {
            call.close();
            self.release_local();
            return Err(e.into());
        }

        tracing::info!("Answered call from {}", call.peer());
        self.state = CallState::Active(call);
        Ok(())
    }

    /// Lehnt den klingelnden Anruf ab, ohne Geräte anzufordern
    pub fn reject(&mut self) {
        match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::PendingIncoming(mut call) => {
                tracing::info!("Rejected call from {}", call.peer());
                call.close();
            }
            other => self.state = other,
        }
    }

    /// Beendet den Anruf und gibt alle lokalen Geräte frei. Idempotent.
    pub fn end(&mut self) {
        match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::Active(mut call) | CallState::PendingIncoming(mut call) => {
                tracing::info!("Ending call {} with {}", call.connection_id(), call.peer());
                call.close();
            }
            CallState::Idle => {}
        }
        self.teardown();
    }

    /// Beendet den Anruf und trennt vom Provider
    pub async fn shutdown(&mut self) {
        self.end();
        if let Some(mut data) = self.data.take() {
            data.close();
        }
        self.provider.destroy().await;
    }

    // ========================================================================
    // MEDIA TOGGLES
    // ========================================================================

    /// Schaltet den ersten Video-Track um. `None` ohne lokalen Stream.
    pub fn toggle_video(&mut self) -> Option<bool> {
        let enabled = self.toggle_track(TrackKind::Video)?;
        self.video_enabled = enabled;
        Some(enabled)
    }

    /// Schaltet den ersten Audio-Track um. `None` ohne lokalen Stream.
    pub fn toggle_audio(&mut self) -> Option<bool> {
        let enabled = self.toggle_track(TrackKind::Audio)?;
        self.audio_enabled = enabled;
        Some(enabled)
    }

    fn toggle_track(&self, kind: TrackKind) -> Option<bool> {
        let track = self.local_stream.as_ref()?.first_track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!("Local {} track enabled: {}", kind, enabled);
        Some(enabled)
    }

    // ========================================================================
    // TEXT CHANNEL
    // ========================================================================

    /// Sendet den aktuellen Entwurf. Leere Entwürfe werden ignoriert.
    pub async fn send_message(&mut self) -> Result<(), SessionError> {
        if self.draft.trim().is_empty() {
            return Ok(());
        }
        let data = self.data.as_ref().ok_or(SessionError::NoDataConnection)?;
        data.send(&self.draft).await?;

        let text = std::mem::take(&mut self.draft);
        self.chat.push(ChatMessage::local(text));
        Ok(())
    }

    // ========================================================================
    // EVENT DISPATCH
    // ========================================================================

    /// Wartet auf das nächste asynchrone Event
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if let Some(peer_events) = self.peer_events.as_mut() {
            tokio::select! {
                event = peer_events.recv() => match event {
                    Some(event) => return Some(SessionEvent::Peer(event)),
                    None => {
                        tracing::warn!("Peer provider event stream ended");
                        self.peer_events = None;
                    }
                },
                event = self.event_rx.recv() => return event,
            }
        }
        self.event_rx.recv().await
    }

    /// Verarbeitet ein Event und meldet was sich geändert hat
    pub fn handle_event(&mut self, event: SessionEvent) -> Option<SessionUpdate> {
        match event {
            SessionEvent::Peer(PeerEvent::Open { id }) => {
                tracing::info!("Local peer id: {}", id);
                self.peer_id = Some(id.clone());
                Some(SessionUpdate::Identity(id))
            }
            SessionEvent::Peer(PeerEvent::IncomingCall(call)) => self.receive_call(call),
            SessionEvent::Peer(PeerEvent::IncomingConnection(data)) => {
                let peer = data.peer().to_string();
                tracing::info!("Data connection from {}", peer);
                self.install_data(data);
                Some(SessionUpdate::DataConnected { peer })
            }
            SessionEvent::Peer(PeerEvent::Disconnected) => {
                tracing::warn!("Disconnected from peer broker");
                Some(SessionUpdate::ProviderDisconnected)
            }
            SessionEvent::Peer(PeerEvent::Error(e)) => {
                tracing::error!("Peer provider error: {}", e);
                Some(SessionUpdate::ProviderError(e.to_string()))
            }
            SessionEvent::Call {
                connection_id,
                signal,
            } => self.handle_call_signal(&connection_id, signal),
            SessionEvent::Message {
                connection_id,
                text,
            } => {
                let current = self
                    .data
                    .as_ref()
                    .is_some_and(|d| d.connection_id() == connection_id);
                if !current {
                    tracing::debug!("Dropping message from stale connection {}", connection_id);
                    return None;
                }
                let message = self.chat.push(ChatMessage::remote(text)).clone();
                Some(SessionUpdate::Message(message))
            }
            SessionEvent::DataClosed { connection_id } => {
                let current = self
                    .data
                    .as_ref()
                    .is_some_and(|d| d.connection_id() == connection_id);
                if !current {
                    return None;
                }
                tracing::info!("Data connection {} closed", connection_id);
                self.data = None;
                Some(SessionUpdate::DataClosed)
            }
        }
    }

    fn receive_call(&mut self, mut call: BoxedCall) -> Option<SessionUpdate> {
        if !matches!(self.state, CallState::Idle) {
            tracing::warn!("Busy, closing incoming call from {}", call.peer());
            call.close();
            return None;
        }

        tracing::info!("Incoming call from {}", call.peer());
        // Remote-Stream wird sofort verdrahtet, nach `answer` ist nichts mehr zu tun
        self.watch_call(&mut call);
        let peer = call.peer().to_string();
        self.state = CallState::PendingIncoming(call);
        Some(SessionUpdate::IncomingCall { peer })
    }

    fn handle_call_signal(
        &mut self,
        connection_id: &str,
        signal: CallSignal,
    ) -> Option<SessionUpdate> {
        let current = self
            .state
            .call()
            .is_some_and(|call| call.connection_id() == connection_id);
        if !current {
            tracing::debug!("Ignoring signal for stale call {}", connection_id);
            return None;
        }

        match signal {
            CallSignal::RemoteStream(stream) => {
                tracing::info!("Remote stream {} arrived", stream.id());
                let stream_id = stream.id().to_string();
                self.remote_view.attach(stream);
                Some(SessionUpdate::RemoteStream { stream_id })
            }
            CallSignal::Closed => {
                tracing::info!("Call {} closed by remote", connection_id);
                let was_active = matches!(self.state, CallState::Active(_));
                if let CallState::Active(mut call) | CallState::PendingIncoming(mut call) =
                    std::mem::replace(&mut self.state, CallState::Idle)
                {
                    call.close();
                }
                if was_active {
                    self.teardown();
                }
                Some(SessionUpdate::CallClosed)
            }
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn acquire_local(&mut self) -> Result<MediaStream, SessionError> {
        let stream = self.capture.get_user_media(self.constraints).await?;

        if let Some(old) = self.local_stream.replace(stream.clone()) {
            old.stop_all();
        }
        self.local_view.attach(stream.clone());

        // Frische Tracks starten aktiv
        if let Some(track) = stream.first_track(TrackKind::Video) {
            self.video_enabled = track.is_enabled();
        }
        if let Some(track) = stream.first_track(TrackKind::Audio) {
            self.audio_enabled = track.is_enabled();
        }

        Ok(stream)
    }

    fn release_local(&mut self) {
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        self.local_view.detach();
    }

    fn teardown(&mut self) {
        self.remote_view.detach();
        self.release_local();
    }

    /// Leitet die Signale eines Anrufs in die eigene Event-Queue
    fn watch_call(&self, call: &mut BoxedCall) {
        let Some(mut signals) = call.take_signals() else {
            tracing::warn!("Signals of call {} already taken", call.connection_id());
            return;
        };
        let connection_id = call.connection_id().to_string();
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let closed = matches!(signal, CallSignal::Closed);
                let event = SessionEvent::Call {
                    connection_id: connection_id.clone(),
                    signal,
                };
                if tx.send(event).is_err() || closed {
                    return;
                }
            }
            let _ = tx.send(SessionEvent::Call {
                connection_id,
                signal: CallSignal::Closed,
            });
        });
    }

    /// Übernimmt einen Datenkanal und ersetzt einen vorherigen
    fn install_data(&mut self, mut data: BoxedData) {
        if let Some(mut incoming) = data.take_incoming() {
            let connection_id = data.connection_id().to_string();
            let tx = self.event_tx.clone();

            tokio::spawn(async move {
                while let Some(text) = incoming.recv().await {
                    let event = SessionEvent::Message {
                        connection_id: connection_id.clone(),
                        text,
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                let _ = tx.send(SessionEvent::DataClosed { connection_id });
            });
        }

        if let Some(mut old) = self.data.replace(data) {
            tracing::debug!("Replacing data connection {}", old.connection_id());
            old.close();
        }
    }
}

impl fmt::Debug for VideoChat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoChat")
            .field("peer_id", &self.peer_id)
            .field("status", &self.status())
            .field("video_enabled", &self.video_enabled)
            .field("audio_enabled", &self.audio_enabled)
            .field("messages", &self.chat.len())
            .finish()
    }
}
