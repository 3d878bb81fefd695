//! Peer Provider Contract
//!
//! Schnittstelle zum Verbindungs-Provider. Der Provider übernimmt Signaling,
//! ICE und Transport; die Session-Schicht konsumiert nur diese Traits.
//!
//! Benachrichtigungen laufen über Channels statt über Callbacks: jedes
//! Handle gibt seinen Receiver genau einmal heraus (`take_*`).

use crate::media::MediaStream;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("Provider is not ready (no identity yet)")]
    NotReady,

    #[error("Invalid target id: {0:?}")]
    InvalidTarget(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Data channel is not open")]
    ChannelNotOpen,

    #[error("Connection {0} is closed")]
    Closed(String),

    #[error("Server error: {0}")]
    Server(String),
}

// ============================================================================
// EVENTS
// ============================================================================

pub type BoxedCall = Box<dyn CallHandle>;
pub type BoxedData = Box<dyn DataHandle>;

/// Events die vom Provider ausgelöst werden
pub enum PeerEvent {
    /// Lokale Identität wurde zugewiesen
    Open { id: String },

    /// Eingehender Anruf, noch nicht beantwortet
    IncomingCall(BoxedCall),

    /// Eingehender Datenkanal
    IncomingConnection(BoxedData),

    /// Verbindung zum Broker verloren
    Disconnected,

    Error(PeerError),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Open { id } => f.debug_struct("Open").field("id", id).finish(),
            PeerEvent::IncomingCall(call) => f.debug_tuple("IncomingCall").field(call).finish(),
            PeerEvent::IncomingConnection(data) => {
                f.debug_tuple("IncomingConnection").field(data).finish()
            }
            PeerEvent::Disconnected => f.write_str("Disconnected"),
            PeerEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Signale eines einzelnen Anrufs
#[derive(Debug, Clone)]
pub enum CallSignal {
    /// Remote-Stream ist angekommen (oder um einen Track gewachsen)
    RemoteStream(MediaStream),

    /// Anruf wurde beendet, lokal oder von der Gegenseite
    Closed,
}

// ============================================================================
// PROVIDER TRAITS
// ============================================================================

#[async_trait]
pub trait PeerProvider: Send + Sync {
    /// Event-Receiver des Providers. Liefert nur beim ersten Aufruf `Some`.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    /// Lokale Identität, sobald zugewiesen
    fn id(&self) -> Option<String>;

    /// Startet einen Medien-Anruf an `target` mit dem lokalen Stream
    async fn call(&self, target: &str, stream: &MediaStream) -> Result<BoxedCall, PeerError>;

    /// Baut einen Datenkanal zu `target` auf
    async fn connect(&self, target: &str) -> Result<BoxedData, PeerError>;

    /// Schließt alle Verbindungen und trennt vom Broker
    async fn destroy(&self);
}

#[async_trait]
pub trait CallHandle: Send + Sync + fmt::Debug {
    fn connection_id(&self) -> &str;

    fn peer(&self) -> &str;

    /// Signal-Receiver (Remote-Stream / Closed). Nur beim ersten Aufruf `Some`.
    fn take_signals(&mut self) -> Option<mpsc::UnboundedReceiver<CallSignal>>;

    /// Beantwortet einen eingehenden Anruf mit dem lokalen Stream
    async fn answer(&mut self, stream: &MediaStream) -> Result<(), PeerError>;

    fn close(&mut self);
}

#[async_trait]
pub trait DataHandle: Send + Sync + fmt::Debug {
    fn connection_id(&self) -> &str;

    fn peer(&self) -> &str;

    /// Eingehende Nachrichten. Nur beim ersten Aufruf `Some`; endet wenn
    /// der Kanal geschlossen wird.
    fn take_incoming(&mut self) -> Option<mpsc::UnboundedReceiver<String>>;

    async fn send(&self, text: &str) -> Result<(), PeerError>;

    fn close(&mut self);
}
