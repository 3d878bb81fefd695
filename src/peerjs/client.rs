//! WebSocket Client für den PeerJS Broker
//!
//! Verwaltet die WebSocket-Verbindung zum Broker:
//! - Registrierung unter einer ID (wartet auf `OPEN`)
//! - Heartbeat
//! - Event-basierte Weitergabe eingehender Nachrichten

use super::config::PeerConfig;
use super::messages::{Message, MessageType};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Maximale Wartezeit auf `OPEN`
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("ID {0:?} is already taken")]
    IdTaken(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Broker hat die ID bestätigt
    Open { id: String },

    /// Nachricht von einem anderen Peer (OFFER, ANSWER, CANDIDATE, LEAVE, EXPIRE)
    Message(Message),

    /// Fehler vom Broker
    Error { kind: MessageType, message: String },

    /// Verbindung getrennt
    Disconnected,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    peer_id: Option<String>,
}

// ============================================================================
// SENDER
// ============================================================================

/// Klonbarer Sender für ausgehende Broker-Nachrichten
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<String>,
}

impl SignalingSender {
    /// Sender auf einen beliebigen Text-Channel (ohne Socket)
    pub(crate) fn from_channel(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, message: &Message) -> Result<(), SignalingError> {
        let text = serde_json::to_string(message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|_| SignalingError::NotConnected)
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

pub struct SignalingClient {
    config: PeerConfig,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    /// Wechselt bei `disconnect` auf `true`; alle Tasks hören darauf
    closing: watch::Sender<bool>,
}

impl SignalingClient {
    pub fn new(config: PeerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (closing, _) = watch::channel(false);

        Self {
            config,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
            closing,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn sender(&self) -> Option<SignalingSender> {
        self.tx.clone().map(|tx| SignalingSender { tx })
    }

    /// Signal für das Ende der Verbindung. Endet auch wenn der Client
    /// gedroppt wird.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Verbindet mit dem Broker und registriert `id`
    pub async fn connect(&mut self, id: String) -> Result<String, SignalingError> {
        let token = random_token();
        let url = self
            .config
            .socket_url(&id, &token)
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to peer broker: {}:{}", self.config.host, self.config.port);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx.clone());
        self.state.write().is_connected = true;

        // Channel für die Registrierungs-Antwort
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task starten
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let requested_id = id.clone();
        let mut read_closing = self.closing.subscribe();

        tokio::spawn(async move {
            loop {
                let msg_result = tokio::select! {
                    msg = read.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = read_closing.changed() => {
                        tracing::debug!("Broker connection closed locally");
                        break;
                    }
                };

                match msg_result {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Message>(&text) {
                        Ok(message) => {
                            Self::handle_server_message(
                                message,
                                &requested_id,
                                &state,
                                &event_tx,
                                &reg_tx,
                            )
                            .await;
                        }
                        Err(e) => tracing::warn!("Ignoring malformed broker message: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten; schließt den Socket beim Beenden
        let mut write_closing = self.closing.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(WsMessage::Text(msg)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    _ = write_closing.changed() => break,
                }
            }
            if let Err(e) = write.close().await {
                tracing::debug!("Closing WebSocket failed: {}", e);
            }
        });

        // Heartbeat-Task starten
        let heartbeat_state = Arc::clone(&self.state);
        let interval = self.config.ping_interval;
        let heartbeat = SignalingSender { tx };
        let mut heartbeat_closing = self.closing.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = heartbeat_closing.changed() => break,
                }
                if !heartbeat_state.read().is_connected {
                    break;
                }
                if heartbeat.send(&Message::heartbeat()).await.is_err() {
                    break;
                }
            }
        });

        tokio::select! {
            result = reg_rx.recv() => match result {
                Some(result) => result,
                None => Err(SignalingError::RegistrationFailed("No response".to_string())),
            },
            _ = tokio::time::sleep(REGISTRATION_TIMEOUT) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Sendet eine Nachricht an den Broker
    pub async fn send(&self, message: &Message) -> Result<(), SignalingError> {
        self.sender()
            .ok_or(SignalingError::NotConnected)?
            .send(message)
            .await
    }

    /// Trennt die Verbindung: der Write-Task schließt den Socket, Read- und
    /// Heartbeat-Task enden
    pub fn disconnect(&mut self) {
        self.tx = None;
        self.closing.send_replace(true);
        let mut state = self.state.write();
        state.is_connected = false;
        state.peer_id = None;
    }

    async fn handle_server_message(
        message: Message,
        requested_id: &str,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match message.kind {
            MessageType::Open => {
                tracing::info!("Registered as {}", requested_id);
                state.write().peer_id = Some(requested_id.to_string());
                let _ = reg_tx.send(Ok(requested_id.to_string())).await;
                let _ = event_tx.send(SignalingEvent::Open {
                    id: requested_id.to_string(),
                });
            }
            MessageType::IdTaken => {
                let _ = reg_tx
                    .send(Err(SignalingError::IdTaken(requested_id.to_string())))
                    .await;
                let _ = event_tx.send(SignalingEvent::Error {
                    kind: message.kind,
                    message: message.error_text(),
                });
            }
            MessageType::InvalidKey | MessageType::Error => {
                let text = message.error_text();
                tracing::error!("Broker error: {}", text);
                let _ = reg_tx
                    .send(Err(SignalingError::RegistrationFailed(text.clone())))
                    .await;
                let _ = event_tx.send(SignalingEvent::Error {
                    kind: message.kind,
                    message: text,
                });
            }
            MessageType::Heartbeat => {}
            MessageType::Offer
            | MessageType::Answer
            | MessageType::Candidate
            | MessageType::Leave
            | MessageType::Expire => {
                let _ = event_tx.send(SignalingEvent::Message(message));
            }
        }
    }
}

/// Zufälliger alphanumerischer Token (Broker-Token, Connection IDs)
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Lokaler Broker: bestätigt jede Registrierung mit `OPEN` und meldet
    /// über den Receiver, wann der Client den Socket geschlossen hat
    pub(crate) async fn local_broker() -> (PeerConfig, oneshot::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (closed_tx, closed_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(WsMessage::Text(r#"{"type":"OPEN"}"#.to_string()))
                .await
                .unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
            let _ = closed_tx.send(());
        });

        let config = PeerConfig {
            host: "127.0.0.1".to_string(),
            port,
            secure: false,
            id: Some("alice".to_string()),
            ice_servers: Vec::new(),
            ..PeerConfig::default()
        };
        (config, closed_rx)
    }

    #[test]
    fn test_random_token_shape() {
        let a = random_token();
        let b = random_token();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_open_resolves_registration() {
        let state = Arc::new(RwLock::new(ClientState::default()));
        let (event_tx, mut events) = broadcast::channel(8);
        let (reg_tx, mut reg_rx) = mpsc::channel(1);

        let open: Message = serde_json::from_str(r#"{"type":"OPEN"}"#).unwrap();
        SignalingClient::handle_server_message(open, "alice", &state, &event_tx, &reg_tx).await;

        assert_eq!(reg_rx.recv().await.unwrap().unwrap(), "alice");
        assert_eq!(state.read().peer_id.as_deref(), Some("alice"));
        assert!(matches!(
            events.recv().await.unwrap(),
            SignalingEvent::Open { id } if id == "alice"
        ));
    }

    #[tokio::test]
    async fn test_id_taken_fails_registration() {
        let state = Arc::new(RwLock::new(ClientState::default()));
        let (event_tx, _events) = broadcast::channel(8);
        let (reg_tx, mut reg_rx) = mpsc::channel(1);

        let taken: Message = serde_json::from_str(r#"{"type":"ID-TAKEN"}"#).unwrap();
        SignalingClient::handle_server_message(taken, "alice", &state, &event_tx, &reg_tx).await;

        assert!(matches!(
            reg_rx.recv().await.unwrap(),
            Err(SignalingError::IdTaken(id)) if id == "alice"
        ));
        assert!(state.read().peer_id.is_none());
    }

    #[tokio::test]
    async fn test_peer_messages_are_forwarded() {
        let state = Arc::new(RwLock::new(ClientState::default()));
        let (event_tx, mut events) = broadcast::channel(8);
        let (reg_tx, _reg_rx) = mpsc::channel(1);

        let leave: Message = serde_json::from_str(r#"{"type":"LEAVE","src":"bob"}"#).unwrap();
        SignalingClient::handle_server_message(leave.clone(), "me", &state, &event_tx, &reg_tx)
            .await;

        match events.recv().await.unwrap() {
            SignalingEvent::Message(msg) => assert_eq!(msg, leave),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_closes_socket() {
        let (config, closed) = local_broker().await;
        let mut client = SignalingClient::new(config);
        let mut closing = client.closing();

        assert_eq!(client.connect("alice".to_string()).await.unwrap(), "alice");
        assert!(client.is_connected());

        client.disconnect();

        assert!(*closing.borrow_and_update());
        tokio::time::timeout(Duration::from_secs(3), closed)
            .await
            .expect("socket still open after disconnect")
            .unwrap();
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(&Message::heartbeat()).await,
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let client = SignalingClient::new(PeerConfig::default());
        assert!(matches!(
            client.send(&Message::heartbeat()).await,
            Err(SignalingError::NotConnected)
        ));
    }
}
