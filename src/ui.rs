//! Terminal Frontend
//!
//! Liest Zeilen von stdin. Zeilen mit `/` sind Befehle, alles andere geht als
//! Chat-Nachricht an den Peer. Ausgaben landen auf stdout, Fehler nur im Log.

use crate::media::{MediaStream, SpeakerPlayback, TrackKind};
use crate::session::{CallStatus, RenderTarget, SessionUpdate, VideoChat};
use tokio::io::{AsyncBufReadExt, BufReader};

pub const HELP: &str = "\
Commands:
  /call <id>   call a peer (opens a chat channel too)
  /answer      answer the incoming call
  /reject      reject the incoming call
  /end         hang up
  /video       toggle local video
  /audio       toggle local audio
  /id          show your peer id
  /help        show this help
  /quit        exit
Anything else is sent as a chat message.";

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(String),
    Answer,
    Reject,
    End,
    ToggleVideo,
    ToggleAudio,
    ShowId,
    Help,
    Quit,
    Say(String),
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Command::Empty;
        }

        let Some(rest) = line.trim_start().strip_prefix('/') else {
            return Command::Say(line.to_string());
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        match name {
            // Ziel wird nicht geprüft, auch eine leere ID geht an den Provider
            "call" => Command::Call(arg.to_string()),
            "answer" => Command::Answer,
            "reject" => Command::Reject,
            "end" | "hangup" => Command::End,
            "video" => Command::ToggleVideo,
            "audio" | "mute" => Command::ToggleAudio,
            "id" => Command::ShowId,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        }
    }
}

// ============================================================================
// RENDERING
// ============================================================================

pub fn render_update(update: &SessionUpdate) -> String {
    match update {
        SessionUpdate::Identity(id) => format!("Your ID: {}", id),
        SessionUpdate::IncomingCall { peer } => {
            format!("Incoming call from {} - /answer or /reject", peer)
        }
        SessionUpdate::RemoteStream { .. } => "Remote stream connected".to_string(),
        SessionUpdate::CallClosed => "Call ended".to_string(),
        SessionUpdate::DataConnected { peer } => format!("Chat connected with {}", peer),
        SessionUpdate::DataClosed => "Chat disconnected".to_string(),
        SessionUpdate::Message(message) => message.to_string(),
        SessionUpdate::ProviderDisconnected => "Disconnected from server".to_string(),
        SessionUpdate::ProviderError(e) => format!("Error: {}", e),
    }
}

fn toggle_label(kind: TrackKind, state: Option<bool>) -> String {
    match state {
        Some(true) => format!("{} on", kind),
        Some(false) => format!("{} off", kind),
        None => format!("no local {} (not in a call)", kind),
    }
}

pub fn render_status(chat: &VideoChat) -> String {
    match (chat.status(), chat.remote_peer()) {
        (CallStatus::Idle, _) => "idle".to_string(),
        (CallStatus::Ringing, Some(peer)) => format!("ringing ({})", peer),
        (CallStatus::InCall, Some(peer)) => format!(
            "in call with {} [video {}, audio {}]",
            peer,
            if chat.video_enabled() { "on" } else { "off" },
            if chat.audio_enabled() { "on" } else { "off" },
        ),
        (status, None) => format!("{:?}", status).to_lowercase(),
    }
}

// ============================================================================
// SPEAKER SURFACE
// ============================================================================

/// Remote Render Target: spielt den Audio-Track des Streams ab
#[derive(Default)]
pub struct SpeakerSurface {
    source: Option<MediaStream>,
    playing: Option<(String, SpeakerPlayback)>,
}

impl SpeakerSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderTarget for SpeakerSurface {
    fn attach(&mut self, stream: MediaStream) {
        let audio = stream.first_track(TrackKind::Audio).cloned();

        // Derselbe Stream kann mit zusätzlichen Tracks erneut kommen
        let already_playing = matches!(
            (&self.playing, &audio),
            (Some((id, _)), Some(track)) if id == track.id()
        );
        if !already_playing {
            if let Some((_, mut playback)) = self.playing.take() {
                playback.stop();
            }
            if let Some(track) = audio {
                tracing::debug!("Playing remote audio track {}", track.id());
                self.playing = Some((track.id().to_string(), SpeakerPlayback::start(track)));
            }
        }

        self.source = Some(stream);
    }

    fn detach(&mut self) {
        if let Some((_, mut playback)) = self.playing.take() {
            playback.stop();
        }
        self.source = None;
    }

    fn source(&self) -> Option<&MediaStream> {
        self.source.as_ref()
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

/// Führt einen Befehl aus. Gibt `false` zurück wenn beendet werden soll.
pub async fn execute(chat: &mut VideoChat, command: Command) -> bool {
    match command {
        Command::Empty => {}
        Command::Call(target) => match chat.place_call(&target).await {
            Ok(()) => println!("Calling {}...", target),
            Err(e) => tracing::error!("Call to {:?} failed: {}", target, e),
        },
        Command::Answer => match chat.answer().await {
            Ok(()) => {
                if chat.status() == CallStatus::InCall {
                    println!("{}", render_status(chat));
                }
            }
            Err(e) => tracing::error!("Failed to answer call: {}", e),
        },
        Command::Reject => chat.reject(),
        Command::End => {
            chat.end();
            println!("{}", render_status(chat));
        }
        Command::ToggleVideo => println!("{}", toggle_label(TrackKind::Video, chat.toggle_video())),
        Command::ToggleAudio => println!("{}", toggle_label(TrackKind::Audio, chat.toggle_audio())),
        Command::ShowId => match chat.peer_id() {
            Some(id) => println!("Your ID: {}", id),
            None => println!("Connecting..."),
        },
        Command::Help => println!("{}", HELP),
        Command::Quit => return false,
        Command::Say(text) => {
            chat.set_draft(text);
            match chat.send_message().await {
                Ok(()) => {
                    if let Some(message) = chat.messages().messages().last() {
                        println!("{}", message);
                    }
                }
                Err(e) => tracing::error!("Failed to send message: {}", e),
            }
        }
        Command::Unknown(name) => println!("Unknown command /{} - try /help", name),
    }
    true
}

/// Hauptschleife: stdin und Session-Events bis `/quit` oder EOF
pub async fn run(mut chat: VideoChat) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    if let Some(id) = chat.peer_id() {
        println!("Your ID: {}", id);
    }
    println!("Type /help for commands.");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("stdin closed");
                    break;
                };
                if !execute(&mut chat, Command::parse(&line)).await {
                    break;
                }
            }
            event = chat.next_event() => {
                let Some(event) = event else { break };
                if let Some(update) = chat.handle_event(event) {
                    println!("{}", render_update(&update));
                }
            }
        }
    }

    chat.shutdown().await;
    Ok(())
}
