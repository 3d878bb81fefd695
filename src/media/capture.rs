//! Media Capture
//!
//! `MediaCapture` ist die Quelle für lokale Streams. Die Anfrage wartet so
//! lange, bis das Gerät zugesagt oder abgelehnt hat; es gibt weder Timeout
//! noch Abbruch.

use super::audio::{self, AudioError};
use super::stream::{MediaConstraints, MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("No capture device available")]
    NoDevice,

    #[error("Capture constraints not supported: {0}")]
    Unsupported(String),

    #[error("Capture device error: {0}")]
    Device(String),

    #[error("Capture request aborted")]
    Aborted,
}

impl From<AudioError> for CaptureError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::NoInputDevice | AudioError::NoOutputDevice => CaptureError::NoDevice,
            AudioError::UnsupportedConfig(msg) => CaptureError::Unsupported(msg),
            other => CaptureError::Device(other.to_string()),
        }
    }
}

// ============================================================================
// CAPTURE CONTRACT
// ============================================================================

#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Fordert einen lokalen Stream an
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, CaptureError>;
}

// ============================================================================
// DEVICE CAPTURE
// ============================================================================

/// Capture über die Standard-Geräte des Systems.
///
/// Audio kommt vom cpal-Mikrofon. Ein Kamera-Backend gibt es nicht, der
/// Video-Track existiert aber, damit Toggles und Verhandlung identisch
/// bleiben.
#[derive(Debug, Default, Clone)]
pub struct DeviceCapture;

impl DeviceCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaCapture for DeviceCapture {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, CaptureError> {
        if !constraints.audio && !constraints.video {
            return Err(CaptureError::Unsupported(
                "at least one of audio or video must be requested".to_string(),
            ));
        }

        let mut tracks = Vec::new();

        if constraints.audio {
            let track = MediaTrack::new(TrackKind::Audio, "default microphone");
            audio::start_microphone(track.clone()).await?;
            tracks.push(track);
        }

        if constraints.video {
            tracing::warn!("No camera backend available, video track carries no frames");
            tracks.push(MediaTrack::new(TrackKind::Video, "placeholder camera"));
        }

        let stream = MediaStream::new(tracks);
        tracing::info!(
            "Captured local stream {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );
        Ok(stream)
    }
}
