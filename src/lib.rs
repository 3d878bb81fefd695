//! peerchat - P2P Video Chat
//!
//! Ein einfacher P2P Video-Chat im Terminal mit:
//! - PeerJS Broker als Signaling-Server
//! - WebRTC für Audio, Video und Text-Chat
//! - Genau einer Anruf-Session gleichzeitig

pub mod media;
pub mod peer;
pub mod peerjs;
pub mod session;
pub mod ui;

use media::DeviceCapture;
use peerjs::{PeerConfig, PeerJsProvider};
use session::{VideoChat, VideoSurface};
use tracing_subscriber::EnvFilter;
use ui::SpeakerSurface;

/// Standard-Filter wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "peerchat=info,webrtc=warn";

/// Logging initialisieren. Logs gehen auf stderr, stdout gehört der UI.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Startet die Applikation
pub async fn run() -> anyhow::Result<()> {
    init_logging();
    tracing::info!("Starting peerchat...");

    let config = PeerConfig::from_env()?;
    tracing::info!(
        "Using peer broker {}:{}{} (secure: {})",
        config.host,
        config.port,
        config.path,
        config.secure
    );

    let provider = PeerJsProvider::start(config).await?;
    let chat = VideoChat::new(Box::new(provider), Box::new(DeviceCapture::new())).with_views(
        Box::new(VideoSurface::new()),
        Box::new(SpeakerSurface::new()),
    );

    ui::run(chat).await
}
