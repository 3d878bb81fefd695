//! Media Streams und Tracks
//!
//! Ein `MediaStream` bündelt Audio- und Video-Tracks. Tracks sind billig
//! klonbare Handles auf einen gemeinsamen Zustand (enabled / stopped), damit
//! Capture-Thread, Peer Connection und Controller denselben Track sehen.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Kapazität des Sample-Broadcasts pro Track
const SAMPLE_CHANNEL_SIZE: usize = 64;

// ============================================================================
// TRACK KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Welche Geräte beim Capture angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

// ============================================================================
// SAMPLES
// ============================================================================

/// Ein kodierter Frame, wie er über einen Track fließt
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

impl MediaSample {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    samples: broadcast::Sender<MediaSample>,
}

/// Handle auf einen einzelnen Audio- oder Video-Track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Erstellt einen neuen, aktiven Track mit zufälliger ID
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_SIZE);

        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                samples,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Aktiviert/deaktiviert den Track ohne ihn zu stoppen
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stoppt den Track endgültig. Quellen beenden sich daraufhin.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Stopped {} track {}", self.inner.kind, self.inner.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Gibt ein Sample an alle Abonnenten weiter.
    ///
    /// Gibt `false` zurück wenn der Track gestoppt ist.
    pub fn push(&self, sample: MediaSample) -> bool {
        if self.is_stopped() {
            return false;
        }
        // Keine Abonnenten ist kein Fehler
        let _ = self.inner.samples.send(sample);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

/// Bündel aus Tracks einer Quelle (lokales Capture oder Remote-Peer)
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Erster Track der gewünschten Art
    pub fn first_track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Mindestens ein Track läuft noch
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_stopped())
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
