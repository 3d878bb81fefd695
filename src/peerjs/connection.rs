//! WebRTC Peer Connections
//!
//! Ein `PeerLink` kapselt genau eine `RTCPeerConnection` (eine Medien- oder
//! Datenverbindung) samt ICE Candidate Puffer, lokalen Track-Pumpen und
//! Remote-Track Empfang.

use super::client::SignalingSender;
use super::messages::{CandidatePayload, ConnectionType, IceCandidate, Message};
use crate::media::{MediaSample, MediaStream, MediaTrack, TrackKind, FRAME_DURATION};
use crate::peer::{CallSignal, PeerError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Wie oft eine Pumpe prüft ob ihr Track gestoppt wurde
const PUMP_POLL: Duration = Duration::from_millis(200);

fn webrtc_err(e: impl std::fmt::Display) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

/// Erstellt eine neue Peer Connection mit Default-Codecs und Interceptors
pub async fn new_peer_connection(
    ice_servers: Vec<RTCIceServer>,
) -> Result<Arc<RTCPeerConnection>, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(webrtc_err)?;

    // Interceptors für RTCP, NACK etc.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
    Ok(Arc::new(pc))
}

/// Codec für einen lokalen Track
fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_string(),
            clock_rate: 8000,
            channels: 1,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

// ============================================================================
// PEER LINK
// ============================================================================

/// Eine einzelne Verbindung zu einem Peer
pub struct PeerLink {
    connection_id: String,
    peer: String,
    kind: ConnectionType,
    pc: Arc<RTCPeerConnection>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    closed_hook: Mutex<Option<ClosedHook>>,
}

type ClosedHook = Box<dyn FnOnce() + Send>;

impl PeerLink {
    /// Erstellt die Peer Connection und leitet lokale ICE Candidates an den
    /// Broker weiter
    pub async fn open(
        ice_servers: Vec<RTCIceServer>,
        connection_id: &str,
        peer: &str,
        kind: ConnectionType,
        signaling: SignalingSender,
    ) -> Result<Arc<Self>, PeerError> {
        let pc = new_peer_connection(ice_servers).await?;

        let link = Arc::new(Self {
            connection_id: connection_id.to_string(),
            peer: peer.to_string(),
            kind,
            pc,
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            pumps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            closed_hook: Mutex::new(None),
        });

        link.forward_candidates(signaling);
        Ok(link)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn forward_candidates(&self, signaling: SignalingSender) {
        let peer = self.peer.clone();
        let connection_id = self.connection_id.clone();
        let kind = self.kind;

        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let signaling = signaling.clone();
                let peer = peer.clone();
                let connection_id = connection_id.clone();

                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            tracing::warn!("Failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    };

                    let payload = CandidatePayload {
                        candidate: init.into(),
                        connection_type: kind,
                        connection_id,
                    };
                    match Message::candidate(&peer, &payload) {
                        Ok(message) => {
                            if let Err(e) = signaling.send(&message).await {
                                tracing::warn!("Failed to send ICE candidate: {}", e);
                            }
                        }
                        Err(e) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                    }
                })
            }));
    }

    /// Registriert `on_closed`; wird genau einmal aufgerufen, egal ob die
    /// Verbindung lokal geschlossen wird oder ICE fehlschlägt
    pub fn watch_state<F>(self: &Arc<Self>, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.closed_hook.lock() = Some(Box::new(on_closed));

        let link = Arc::downgrade(self);
        let connection_id = self.connection_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection {} state: {:?}", connection_id, s);

                if matches!(
                    s,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    if let Some(link) = link.upgrade() {
                        link.close();
                    }
                }
                Box::pin(async {})
            }));
    }

    // ========================================================================
    // SDP
    // ========================================================================

    pub async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(offer.sdp)
    }

    pub async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(answer.sdp)
    }

    /// Setzt die Remote Description (`offer` oder `answer`) und spielt
    /// gepufferte Candidates ein
    pub async fn set_remote_description(&self, sdp_type: &str, sdp: String) -> Result<(), PeerError> {
        let description = match sdp_type {
            "offer" => RTCSessionDescription::offer(sdp),
            "answer" => RTCSessionDescription::answer(sdp),
            other => return Err(PeerError::WebRTC(format!("Unexpected SDP type {:?}", other))),
        }
        .map_err(webrtc_err)?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(webrtc_err)?;
        self.remote_description_set.store(true, Ordering::SeqCst);

        let pending: Vec<RTCIceCandidateInit> = self.pending_candidates.lock().drain(..).collect();
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered ICE candidate: {}", e);
            }
        }
        Ok(())
    }

    /// Fügt einen Remote Candidate hinzu oder puffert ihn bis die Remote
    /// Description gesetzt ist
    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit::from(candidate);
        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.pending_candidates.lock().push(init);
            return Ok(());
        }
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    #[cfg(test)]
    fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    // ========================================================================
    // MEDIA
    // ========================================================================

    /// Hängt alle Tracks des lokalen Streams an die Verbindung
    pub async fn add_local_stream(&self, stream: &MediaStream) -> Result<(), PeerError> {
        for track in stream.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                stream.id().to_string(),
            ));

            let rtp_sender = self
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;

            // RTCP lesen damit die Interceptors arbeiten
            let rtcp = tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtp_sender.read(&mut buf).await.is_ok() {}
            });

            let pump = tokio::spawn(pump_track(track.clone(), local));

            let mut pumps = self.pumps.lock();
            pumps.push(rtcp);
            pumps.push(pump);
        }
        Ok(())
    }

    /// Baut aus eingehenden Remote-Tracks einen `MediaStream` und meldet ihn
    /// bei jedem neuen Track über `signals`
    pub fn receive_remote_stream(&self, signals: mpsc::UnboundedSender<CallSignal>) {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let tracks: Arc<Mutex<Vec<MediaTrack>>> = Arc::new(Mutex::new(Vec::new()));

        self.pc.on_track(Box::new(move |remote: Arc<TrackRemote>, _, _| {
            let kind = match remote.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!("Received {} track: {:?}", kind, remote.codec().capability.mime_type);

            let track = MediaTrack::new(kind, format!("remote {}", kind));
            let stream = {
                let mut tracks = tracks.lock();
                tracks.push(track.clone());
                MediaStream::with_id(stream_id.clone(), tracks.clone())
            };
            let _ = signals.send(CallSignal::RemoteStream(stream));

            Box::pin(async move {
                read_remote_track(remote, track).await;
            })
        }));
    }

    // ========================================================================
    // DATA
    // ========================================================================

    /// Erstellt den (einzigen) Datenkanal einer ausgehenden Datenverbindung
    pub async fn create_data_channel(&self) -> Result<Arc<RTCDataChannel>, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        self.pc
            .create_data_channel(&self.connection_id, Some(init))
            .await
            .map_err(webrtc_err)
    }

    /// Ruft `handler` für jeden vom Peer geöffneten Datenkanal auf. Läuft
    /// direkt im Callback, bevor der Kanal Nachrichten zustellt.
    pub fn on_data_channel<F>(&self, mut handler: F)
    where
        F: FnMut(Arc<RTCDataChannel>) + Send + Sync + 'static,
    {
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                tracing::debug!("Remote data channel {:?} opened", dc.label());
                handler(dc);
                Box::pin(async {})
            }));
    }

    /// Schließt die Verbindung. Mehrfache Aufrufe sind wirkungslos.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
        let hook = self.closed_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }

        let pc = Arc::clone(&self.pc);
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                tracing::warn!("Failed to close peer connection {}: {}", connection_id, e);
            }
        });
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("connection_id", &self.connection_id)
            .field("peer", &self.peer)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// TRACK PUMPS
// ============================================================================

/// Schreibt Samples eines lokalen Tracks auf den WebRTC Track bis der
/// lokale Track gestoppt wird
async fn pump_track(track: MediaTrack, local: Arc<TrackLocalStaticSample>) {
    let mut samples = track.subscribe();

    while !track.is_stopped() {
        let sample = match tokio::time::timeout(PUMP_POLL, samples.recv()).await {
            Err(_) => continue,
            Ok(Ok(sample)) => sample,
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                tracing::debug!("Track {} skipped {} samples", track.id(), n);
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
        };

        let out = Sample {
            data: sample.data,
            duration: sample.duration,
            ..Default::default()
        };
        if let Err(e) = local.write_sample(&out).await {
            tracing::debug!("Failed to write sample on {}: {}", track.id(), e);
        }
    }
    tracing::debug!("Pump for {} track {} finished", track.kind(), track.id());
}

/// Liest RTP vom Remote-Track bis der Peer aufhört zu senden
async fn read_remote_track(remote: Arc<TrackRemote>, track: MediaTrack) {
    let duration = match track.kind() {
        TrackKind::Audio => FRAME_DURATION,
        TrackKind::Video => Duration::ZERO,
    };

    loop {
        match remote.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                if !track.push(MediaSample::new(packet.payload, duration)) {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Remote {} track ended: {}", track.kind(), e);
                break;
            }
        }
    }
    track.stop();
}
