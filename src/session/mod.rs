//! Session Module - Anruf-Lebenszyklus und Chat
//!
//! Dieses Modul verwaltet:
//! - Die eine erlaubte Anruf-Session (Idle / klingelt / aktiv)
//! - Lokale Media Toggles
//! - Den Text-Chat über den Datenkanal

mod chat;
mod controller;
mod surface;

#[cfg(test)]
pub(crate) mod testing;

pub use chat::{ChatLog, ChatMessage, MessageOrigin, LOCAL_PREFIX};
pub use controller::{CallStatus, SessionError, SessionEvent, SessionUpdate, VideoChat};
pub use surface::{RenderTarget, VideoSurface};
