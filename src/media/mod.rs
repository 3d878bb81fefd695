//! Media Module - lokale und entfernte Streams
//!
//! Dieses Modul verwaltet:
//! - Media Streams und Tracks (enabled / stopped)
//! - Capture vom Mikrofon
//! - Playback auf dem Lautsprecher
//! - PCMU Encoding/Decoding

mod audio;
mod capture;
mod codec;
mod stream;

pub use audio::{AudioError, SpeakerPlayback, FRAME_DURATION, FRAME_SIZE, SAMPLE_RATE};
pub use capture::{CaptureError, DeviceCapture, MediaCapture};
pub use codec::{decode_frame, encode_frame, ULAW_SILENCE};
pub use stream::{MediaConstraints, MediaSample, MediaStream, MediaTrack, TrackKind};
