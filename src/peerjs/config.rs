//! Konfiguration des PeerJS Brokers
//!
//! Standardwerte zeigen auf den öffentlichen PeerJS Cloud-Server und können
//! über Umgebungsvariablen überschrieben werden.

use std::time::Duration;
use thiserror::Error;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_HOST: &str = "0.peerjs.com";
pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_PATH: &str = "/";
pub const DEFAULT_KEY: &str = "peerjs";

/// Heartbeat-Intervall des PeerJS Protokolls
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(5000);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid broker url: {0}")]
    Url(#[from] url::ParseError),
}

/// ICE Server (STUN/TURN)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub key: String,
    pub secure: bool,
    /// Gewünschte eigene ID; ohne wird eine UUID erzeugt
    pub id: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub ping_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            key: DEFAULT_KEY.to_string(),
            secure: true,
            id: None,
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: String::new(),
                credential: String::new(),
            }],
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl PeerConfig {
    /// Liest die Konfiguration aus den `PEER_*` / `TURN_*` Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("PEER_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PEER_PORT") {
            config.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                name: "PEER_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(path) = lookup("PEER_PATH") {
            config.path = path;
        }
        if let Some(key) = lookup("PEER_KEY") {
            config.key = key;
        }
        if let Some(secure) = lookup("PEER_SECURE") {
            config.secure = parse_bool(&secure).ok_or(ConfigError::InvalidValue {
                name: "PEER_SECURE",
                value: secure.clone(),
            })?;
        }
        config.id = lookup("PEER_ID").filter(|id| !id.trim().is_empty());

        if let Some(url) = lookup("TURN_URL") {
            config.ice_servers.push(IceServer {
                urls: vec![url],
                username: lookup("TURN_USERNAME").unwrap_or_default(),
                credential: lookup("TURN_CREDENTIAL").unwrap_or_default(),
            });
        }

        Ok(config)
    }

    /// WebSocket URL des Brokers für `id` und `token`
    pub fn socket_url(&self, id: &str, token: &str) -> Result<Url, ConfigError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let base = format!(
            "{}://{}:{}{}peerjs",
            scheme,
            self.host,
            self.port,
            normalize_path(&self.path)
        );

        let mut url = Url::parse(&base)?;
        url.query_pairs_mut()
            .append_pair("key", &self.key)
            .append_pair("id", id)
            .append_pair("token", token);
        Ok(url)
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }
}

/// Pfad immer mit führendem und abschließendem `/`
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
