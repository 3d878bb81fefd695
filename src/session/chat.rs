//! Chat-Verlauf
//!
//! Append-only Liste in Empfangsreihenfolge. Keine Persistenz, keine
//! Zustellbestätigung.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Präfix für lokal gesendete Nachrichten
pub const LOCAL_PREFIX: &str = "You: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub origin: MessageOrigin,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn local(text: impl Into<String>) -> Self {
        Self {
            origin: MessageOrigin::Local,
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    pub fn remote(text: impl Into<String>) -> Self {
        Self {
            origin: MessageOrigin::Remote,
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            MessageOrigin::Local => write!(f, "{}{}", LOCAL_PREFIX, self.text),
            MessageOrigin::Remote => f.write_str(&self.text),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) -> &ChatMessage {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Gerenderte Zeilen, wie sie in der Nachrichtenliste erscheinen
    pub fn lines(&self) -> Vec<String> {
        self.messages.iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
