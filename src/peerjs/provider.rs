//! PeerJS Provider
//!
//! Implementiert `PeerProvider` über einen PeerJS Broker: registriert die
//! eigene ID, verteilt OFFER / ANSWER / CANDIDATE auf die einzelnen
//! Verbindungen und meldet eingehende Anrufe und Datenkanäle als Events.

use super::client::{random_token, SignalingClient, SignalingError, SignalingEvent, SignalingSender};
use super::config::PeerConfig;
use super::connection::PeerLink;
use super::messages::{
    AnswerPayload, CandidatePayload, ConnectionType, Message, MessageType, OfferPayload,
    SessionDescription,
};
use crate::media::MediaStream;
use crate::peer::{
    BoxedCall, BoxedData, CallHandle, CallSignal, DataHandle, PeerError, PeerEvent, PeerProvider,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

impl From<SignalingError> for PeerError {
    fn from(e: SignalingError) -> Self {
        match e {
            SignalingError::NotConnected => PeerError::NotReady,
            other => PeerError::Signaling(other.to_string()),
        }
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Zustand, den Dispatch-Task und Handles gemeinsam nutzen
struct Shared {
    config: PeerConfig,
    id: String,
    signaling: SignalingSender,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Shared {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn link(&self, connection_id: &str) -> Option<Arc<PeerLink>> {
        self.links.lock().get(connection_id).cloned()
    }

    /// Öffnet eine neue Verbindung und trägt sie in die Registry ein.
    /// `on_closed` läuft nachdem der Eintrag entfernt wurde.
    async fn open_link<F>(
        self: &Arc<Self>,
        connection_id: &str,
        peer: &str,
        kind: ConnectionType,
        on_closed: F,
    ) -> Result<Arc<PeerLink>, PeerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let link = PeerLink::open(
            self.config.rtc_ice_servers(),
            connection_id,
            peer,
            kind,
            self.signaling.clone(),
        )
        .await?;

        let shared = Arc::downgrade(self);
        let id = connection_id.to_string();
        link.watch_state(move || {
            if let Some(shared) = shared.upgrade() {
                shared.links.lock().remove(&id);
            }
            tracing::debug!("Connection {} closed", id);
            on_closed();
        });

        self.links
            .lock()
            .insert(connection_id.to_string(), Arc::clone(&link));
        Ok(link)
    }

    /// Schließt alle Verbindungen zu `peer`
    fn close_peer(&self, peer: &str) {
        let links: Vec<Arc<PeerLink>> = self
            .links
            .lock()
            .values()
            .filter(|l| l.peer() == peer)
            .cloned()
            .collect();

        for link in links {
            link.close();
        }
    }

    fn close_all(&self) {
        let links: Vec<Arc<PeerLink>> = self.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            link.close();
        }
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    async fn handle_signaling(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Open { id } => self.emit(PeerEvent::Open { id }),
            SignalingEvent::Message(message) => self.handle_message(message).await,
            SignalingEvent::Error { kind, message } => {
                tracing::error!("Broker reported {:?}: {}", kind, message);
                self.emit(PeerEvent::Error(PeerError::Server(message)));
            }
            SignalingEvent::Disconnected => {
                tracing::warn!("Lost connection to peer broker");
                self.emit(PeerEvent::Disconnected);
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, message: Message) {
        let Some(peer) = message.src.clone() else {
            tracing::debug!("Ignoring {:?} without source", message.kind);
            return;
        };

        match message.kind {
            MessageType::Offer => match message.parse_payload::<OfferPayload>() {
                Some(offer) => {
                    if let Err(e) = self.handle_offer(&peer, offer).await {
                        tracing::error!("Failed to handle offer from {}: {}", peer, e);
                        self.emit(PeerEvent::Error(e));
                    }
                }
                None => tracing::warn!("Malformed OFFER from {}", peer),
            },
            MessageType::Answer => match message.parse_payload::<AnswerPayload>() {
                Some(answer) => match self.link(&answer.connection_id) {
                    Some(link) => {
                        if let Err(e) = link
                            .set_remote_description(&answer.sdp.kind, answer.sdp.sdp)
                            .await
                        {
                            tracing::error!("Failed to apply answer from {}: {}", peer, e);
                            link.close();
                        }
                    }
                    None => tracing::debug!("ANSWER for unknown connection {}", answer.connection_id),
                },
                None => tracing::warn!("Malformed ANSWER from {}", peer),
            },
            MessageType::Candidate => match message.parse_payload::<CandidatePayload>() {
                Some(payload) => match self.link(&payload.connection_id) {
                    Some(link) => {
                        if let Err(e) = link.add_candidate(payload.candidate).await {
                            tracing::warn!("Failed to add ICE candidate from {}: {}", peer, e);
                        }
                    }
                    None => {
                        tracing::debug!("CANDIDATE for unknown connection {}", payload.connection_id)
                    }
                },
                None => tracing::warn!("Malformed CANDIDATE from {}", peer),
            },
            MessageType::Leave => {
                tracing::info!("Peer {} left", peer);
                self.close_peer(&peer);
            }
            MessageType::Expire => {
                tracing::warn!("Could not reach peer {}", peer);
                self.close_peer(&peer);
                self.emit(PeerEvent::Error(PeerError::Server(format!(
                    "Could not connect to peer {}",
                    peer
                ))));
            }
            _ => {}
        }
    }

    async fn handle_offer(self: &Arc<Self>, peer: &str, offer: OfferPayload) -> Result<(), PeerError> {
        if self.link(&offer.connection_id).is_some() {
            tracing::warn!("Duplicate offer for {}", offer.connection_id);
            return Ok(());
        }

        match offer.connection_type {
            ConnectionType::Media => {
                tracing::info!("Incoming call {} from {}", offer.connection_id, peer);
                let call = MediaCall::open(self, &offer.connection_id, peer, Some(offer.sdp)).await?;
                self.emit(PeerEvent::IncomingCall(Box::new(call)));
            }
            ConnectionType::Data => {
                tracing::info!("Incoming data connection {} from {}", offer.connection_id, peer);
                let data = DataConnection::accept(self, &offer.connection_id, peer, offer.sdp).await?;
                self.emit(PeerEvent::IncomingConnection(Box::new(data)));
            }
        }
        Ok(())
    }
}

/// Verteilt Broker-Events bis die Verbindung lokal getrennt wird oder der
/// Event-Strom endet
async fn dispatch(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<SignalingEvent>,
    mut closing: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => shared.handle_signaling(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} signaling events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = closing.changed() => break,
        }
    }
    tracing::debug!("Signaling dispatch for {} stopped", shared.id);
}

// ============================================================================
// PROVIDER
// ============================================================================

/// `PeerProvider` über einen PeerJS Broker
pub struct PeerJsProvider {
    shared: Arc<Shared>,
    client: Mutex<Option<SignalingClient>>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl PeerJsProvider {
    /// Verbindet mit dem Broker und registriert die konfigurierte ID
    /// (oder eine zufällige UUID)
    pub async fn start(config: PeerConfig) -> Result<Self, PeerError> {
        let requested = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut client = SignalingClient::new(config.clone());
        let signaling_events = client.subscribe();
        let closing = client.closing();
        let id = client.connect(requested).await?;
        let signaling = client.sender().ok_or(PeerError::NotReady)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            id,
            signaling,
            links: Mutex::new(HashMap::new()),
            events: tx,
        });

        tokio::spawn(dispatch(Arc::clone(&shared), signaling_events, closing));

        Ok(Self {
            shared,
            client: Mutex::new(Some(client)),
            events: Some(rx),
        })
    }
}

#[async_trait]
impl PeerProvider for PeerJsProvider {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.take()
    }

    fn id(&self) -> Option<String> {
        Some(self.shared.id.clone())
    }

    async fn call(&self, target: &str, stream: &MediaStream) -> Result<BoxedCall, PeerError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(PeerError::InvalidTarget(target.to_string()));
        }

        let connection_id = format!("mc_{}", random_token());
        tracing::info!("Calling {} ({})", target, connection_id);

        let call = MediaCall::open(&self.shared, &connection_id, target, None).await?;
        if let Err(e) = call.offer(stream).await {
            call.link.close();
            return Err(e);
        }
        Ok(Box::new(call))
    }

    async fn connect(&self, target: &str) -> Result<BoxedData, PeerError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(PeerError::InvalidTarget(target.to_string()));
        }

        let connection_id = format!("dc_{}", random_token());
        let data = DataConnection::dial(&self.shared, &connection_id, target).await?;
        Ok(Box::new(data))
    }

    async fn destroy(&self) {
        tracing::info!("Destroying peer {}", self.shared.id);
        self.shared.close_all();
        if let Some(mut client) = self.client.lock().take() {
            client.disconnect();
        }
    }
}

impl fmt::Debug for PeerJsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerJsProvider")
            .field("id", &self.shared.id)
            .field("connections", &self.shared.links.lock().len())
            .finish()
    }
}

// ============================================================================
// MEDIA CALL
// ============================================================================

/// Medienverbindung zu einem Peer
pub struct MediaCall {
    link: Arc<PeerLink>,
    shared: Arc<Shared>,
    /// Offer eines eingehenden, noch nicht beantworteten Anrufs
    offer: Option<SessionDescription>,
    signals: Option<mpsc::UnboundedReceiver<CallSignal>>,
}

impl MediaCall {
    async fn open(
        shared: &Arc<Shared>,
        connection_id: &str,
        peer: &str,
        offer: Option<SessionDescription>,
    ) -> Result<Self, PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let closed_tx = tx.clone();
        let link = shared
            .open_link(connection_id, peer, ConnectionType::Media, move || {
                let _ = closed_tx.send(CallSignal::Closed);
            })
            .await?;
        link.receive_remote_stream(tx);

        Ok(Self {
            link,
            shared: Arc::clone(shared),
            offer,
            signals: Some(rx),
        })
    }

    /// Ausgehend: lokale Tracks anhängen und OFFER senden
    async fn offer(&self, stream: &MediaStream) -> Result<(), PeerError> {
        self.link.add_local_stream(stream).await?;
        let sdp = self.link.create_offer().await?;

        let message = Message::offer(
            self.link.peer(),
            &OfferPayload::media(self.link.connection_id(), sdp),
        )
        .map_err(|e| PeerError::Signaling(e.to_string()))?;
        self.shared.signaling.send(&message).await?;
        Ok(())
    }
}

#[async_trait]
impl CallHandle for MediaCall {
    fn connection_id(&self) -> &str {
        self.link.connection_id()
    }

    fn peer(&self) -> &str {
        self.link.peer()
    }

    fn take_signals(&mut self) -> Option<mpsc::UnboundedReceiver<CallSignal>> {
        self.signals.take()
    }

    async fn answer(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        if self.link.is_closed() {
            return Err(PeerError::Closed(self.link.connection_id().to_string()));
        }
        let offer = self.offer.take().ok_or_else(|| {
            PeerError::Signaling(format!("{} has no pending offer", self.link.connection_id()))
        })?;

        self.link.set_remote_description(&offer.kind, offer.sdp).await?;
        self.link.add_local_stream(stream).await?;
        let sdp = self.link.create_answer().await?;

        let message = Message::answer(
            self.link.peer(),
            &AnswerPayload::new(ConnectionType::Media, self.link.connection_id(), sdp),
        )
        .map_err(|e| PeerError::Signaling(e.to_string()))?;
        self.shared.signaling.send(&message).await?;

        tracing::info!("Answered call {}", self.link.connection_id());
        Ok(())
    }

    fn close(&mut self) {
        self.link.close();
    }
}

impl fmt::Debug for MediaCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaCall")
            .field("link", &self.link)
            .field("pending_offer", &self.offer.is_some())
            .finish()
    }
}

// ============================================================================
// DATA CONNECTION
// ============================================================================

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;
type InboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

/// Datenverbindung (ein Text-Datenkanal) zu einem Peer
pub struct DataConnection {
    link: Arc<PeerLink>,
    channel: ChannelSlot,
    incoming: Option<mpsc::UnboundedReceiver<String>>,
}

impl DataConnection {
    async fn open(
        shared: &Arc<Shared>,
        connection_id: &str,
        peer: &str,
    ) -> Result<(Self, InboundSlot), PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound: InboundSlot = Arc::new(Mutex::new(Some(tx)));

        // Ende der Verbindung beendet auch den Nachrichtenstrom
        let closed_inbound = Arc::clone(&inbound);
        let link = shared
            .open_link(connection_id, peer, ConnectionType::Data, move || {
                closed_inbound.lock().take();
            })
            .await?;

        let data = Self {
            link,
            channel: Arc::new(Mutex::new(None)),
            incoming: Some(rx),
        };
        Ok((data, inbound))
    }

    /// Ausgehend: Datenkanal anlegen und OFFER senden
    async fn dial(shared: &Arc<Shared>, connection_id: &str, peer: &str) -> Result<Self, PeerError> {
        let (data, inbound) = Self::open(shared, connection_id, peer).await?;

        let result = async {
            let channel = data.link.create_data_channel().await?;
            attach_channel(channel, &data.channel, &inbound);

            let sdp = data.link.create_offer().await?;
            let message = Message::offer(peer, &OfferPayload::data(connection_id, sdp))
                .map_err(|e| PeerError::Signaling(e.to_string()))?;
            shared.signaling.send(&message).await?;
            Ok::<_, PeerError>(())
        }
        .await;

        match result {
            Ok(()) => Ok(data),
            Err(e) => {
                data.link.close();
                Err(e)
            }
        }
    }

    /// Eingehend: Offer sofort beantworten, der Kanal kommt über
    /// `on_data_channel` und wird dort direkt verdrahtet
    async fn accept(
        shared: &Arc<Shared>,
        connection_id: &str,
        peer: &str,
        offer: SessionDescription,
    ) -> Result<Self, PeerError> {
        let (data, inbound) = Self::open(shared, connection_id, peer).await?;

        data.link
            .on_data_channel(channel_acceptor(Arc::clone(&data.channel), inbound));

        let result = async {
            data.link.set_remote_description(&offer.kind, offer.sdp).await?;
            let sdp = data.link.create_answer().await?;
            let message = Message::answer(
                peer,
                &AnswerPayload::new(ConnectionType::Data, connection_id, sdp),
            )
            .map_err(|e| PeerError::Signaling(e.to_string()))?;
            shared.signaling.send(&message).await?;
            Ok::<_, PeerError>(())
        }
        .await;

        match result {
            Ok(()) => Ok(data),
            Err(e) => {
                data.link.close();
                Err(e)
            }
        }
    }
}

/// Handler für `on_data_channel` einer eingehenden Datenverbindung
fn channel_acceptor(
    slot: ChannelSlot,
    inbound: InboundSlot,
) -> impl FnMut(Arc<RTCDataChannel>) + Send + Sync + 'static {
    move |channel| attach_channel(channel, &slot, &inbound)
}

/// Verbindet einen Datenkanal mit dem Nachrichtenstrom der Verbindung
fn attach_channel(channel: Arc<RTCDataChannel>, slot: &ChannelSlot, inbound: &InboundSlot) {
    let message_inbound = Arc::clone(inbound);
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        if let Some(tx) = message_inbound.lock().as_ref() {
            let _ = tx.send(text);
        }
        Box::pin(async {})
    }));

    let close_inbound: Weak<Mutex<Option<mpsc::UnboundedSender<String>>>> = Arc::downgrade(inbound);
    channel.on_close(Box::new(move || {
        if let Some(inbound) = close_inbound.upgrade() {
            inbound.lock().take();
        }
        Box::pin(async {})
    }));

    *slot.lock() = Some(channel);
}

#[async_trait]
impl DataHandle for DataConnection {
    fn connection_id(&self) -> &str {
        self.link.connection_id()
    }

    fn peer(&self) -> &str {
        self.link.peer()
    }

    fn take_incoming(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.incoming.take()
    }

    async fn send(&self, text: &str) -> Result<(), PeerError> {
        let channel = self.channel.lock().clone().ok_or(PeerError::ChannelNotOpen)?;
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(PeerError::ChannelNotOpen);
        }

        channel
            .send_text(text.to_string())
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) {
        self.link.close();
    }
}

impl fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataConnection")
            .field("link", &self.link)
            .field("has_channel", &self.channel.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use crate::peerjs::client::tests::local_broker;
    use std::time::Duration;

    fn shared() -> (Arc<Shared>, mpsc::Receiver<String>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (wire_tx, wire_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config: PeerConfig {
                ice_servers: Vec::new(),
                ..PeerConfig::default()
            },
            id: "me".to_string(),
            signaling: SignalingSender::from_channel(wire_tx),
            links: Mutex::new(HashMap::new()),
            events: events_tx,
        });
        (shared, wire_rx, events_rx)
    }

    /// Nächste gesendete Nachricht eines Typs (Candidates werden übersprungen)
    async fn next_sent(wire: &mut mpsc::Receiver<String>, kind: MessageType) -> Message {
        loop {
            let text = wire.recv().await.unwrap();
            let message: Message = serde_json::from_str(&text).unwrap();
            if message.kind == kind {
                return message;
            }
        }
    }

    fn local_stream() -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "cam"),
        ])
    }

    #[tokio::test]
    async fn test_outgoing_call_sends_media_offer() {
        let (shared, mut wire, _events) = shared();

        let call = MediaCall::open(&shared, "mc_out", "bob", None).await.unwrap();
        call.offer(&local_stream()).await.unwrap();

        let message = next_sent(&mut wire, MessageType::Offer).await;
        assert_eq!(message.dst.as_deref(), Some("bob"));
        let offer: OfferPayload = message.parse_payload().unwrap();
        assert_eq!(offer.connection_type, ConnectionType::Media);
        assert_eq!(offer.connection_id, "mc_out");
        assert!(offer.sdp.sdp.contains("PCMU"));
        assert!(shared.link("mc_out").is_some());
    }

    #[tokio::test]
    async fn test_leave_closes_calls_of_that_peer() {
        let (shared, _wire, _events) = shared();

        let mut call = MediaCall::open(&shared, "mc_1", "bob", None).await.unwrap();
        let _other = MediaCall::open(&shared, "mc_2", "carol", None).await.unwrap();
        let mut signals = call.take_signals().unwrap();

        let leave: Message = serde_json::from_str(r#"{"type":"LEAVE","src":"bob"}"#).unwrap();
        shared.handle_message(leave).await;

        assert!(matches!(signals.recv().await, Some(CallSignal::Closed)));
        assert!(shared.link("mc_1").is_none());
        assert!(shared.link("mc_2").is_some());
    }

    #[tokio::test]
    async fn test_expire_reports_unreachable_peer() {
        let (shared, _wire, mut events) = shared();

        let expire: Message = serde_json::from_str(r#"{"type":"EXPIRE","src":"ghost"}"#).unwrap();
        shared.handle_message(expire).await;

        match events.recv().await.unwrap() {
            PeerEvent::Error(PeerError::Server(msg)) => assert!(msg.contains("ghost")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_connection_is_ignored() {
        let (shared, _wire, mut events) = shared();

        let raw = r#"{"type":"CANDIDATE","src":"bob","payload":{
            "candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0},
            "type":"media","connectionId":"mc_nope"}}"#;
        shared.handle_message(serde_json::from_str(raw).unwrap()).await;

        assert!(events.try_recv().is_err());
        assert!(shared.links.lock().is_empty());
    }

    #[tokio::test]
    async fn test_incoming_offer_is_answered_by_other_side() {
        // Zwei Peers im selben Prozess; Nachrichten werden von Hand vermittelt
        let (caller, mut caller_wire, _caller_events) = shared();
        let (callee, mut callee_wire, mut callee_events) = shared();

        let call = MediaCall::open(&caller, "mc_x", "callee", None).await.unwrap();
        call.offer(&local_stream()).await.unwrap();

        let mut offer = next_sent(&mut caller_wire, MessageType::Offer).await;
        offer.src = Some("caller".to_string());
        callee.handle_message(offer).await;

        let mut incoming = match callee_events.recv().await.unwrap() {
            PeerEvent::IncomingCall(call) => call,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(incoming.peer(), "caller");
        assert_eq!(incoming.connection_id(), "mc_x");

        incoming.answer(&local_stream()).await.unwrap();
        let answer = next_sent(&mut callee_wire, MessageType::Answer).await;
        let payload: AnswerPayload = answer.parse_payload().unwrap();
        assert_eq!(payload.connection_id, "mc_x");
        assert_eq!(payload.sdp.kind, "answer");

        // Zweites Beantworten ist ein Fehler
        assert!(incoming.answer(&local_stream()).await.is_err());
    }

    #[tokio::test]
    async fn test_send_before_channel_open() {
        let (shared, _wire, _events) = shared();
        let (data, _inbound) = DataConnection::open(&shared, "dc_1", "bob").await.unwrap();

        assert!(matches!(
            data.send("hi").await,
            Err(PeerError::ChannelNotOpen)
        ));
    }

    #[tokio::test]
    async fn test_remote_channel_is_attached_inside_callback() {
        let (shared, _wire, _events) = shared();
        let (data, inbound) = DataConnection::open(&shared, "dc_in", "bob").await.unwrap();
        let (other, _) = DataConnection::open(&shared, "dc_other", "carol").await.unwrap();
        let channel = other.link.create_data_channel().await.unwrap();

        let mut accept = channel_acceptor(Arc::clone(&data.channel), inbound);
        accept(Arc::clone(&channel));

        // Kein Task dazwischen: der Kanal steckt sofort in der Verbindung
        let attached = data.channel.lock().clone().unwrap();
        assert!(Arc::ptr_eq(&attached, &channel));
    }

    #[tokio::test]
    async fn test_destroy_closes_broker_socket() {
        let (config, closed) = local_broker().await;
        let provider = PeerJsProvider::start(config).await.unwrap();
        assert_eq!(provider.id().as_deref(), Some("alice"));

        let shared = Arc::downgrade(&provider.shared);
        provider.destroy().await;
        drop(provider);

        tokio::time::timeout(Duration::from_secs(3), closed)
            .await
            .expect("broker socket still open after destroy")
            .unwrap();

        // Dispatch-Task hat seinen Anteil am Zustand freigegeben
        tokio::time::timeout(Duration::from_secs(3), async {
            while shared.upgrade().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dispatch task still holds provider state");
    }

    #[tokio::test]
    async fn test_closing_data_connection_ends_incoming() {
        let (shared, _wire, _events) = shared();
        let (mut data, _inbound) = DataConnection::open(&shared, "dc_1", "bob").await.unwrap();
        let mut incoming = data.take_incoming().unwrap();

        data.close();
        // `_inbound` hält keinen Sender mehr
        assert!(incoming.recv().await.is_none());
    }
}
