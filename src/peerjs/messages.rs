//! Message Types für das PeerJS Broker-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt `{type, src?, dst?, payload?}`.
//! Der Broker setzt `src`; Clients setzen `dst`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kennung die wir im `browser`-Feld melden
pub const CLIENT_NAME: &str = "peerchat";

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum MessageType {
    Open,
    Leave,
    Candidate,
    Offer,
    Answer,
    Expire,
    Heartbeat,
    IdTaken,
    InvalidKey,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    fn to(kind: MessageType, dst: &str, payload: Value) -> Self {
        Self {
            kind,
            src: None,
            dst: Some(dst.to_string()),
            payload: Some(payload),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: MessageType::Heartbeat,
            src: None,
            dst: None,
            payload: None,
        }
    }

    pub fn offer(dst: &str, payload: &OfferPayload) -> Result<Self, serde_json::Error> {
        Ok(Self::to(MessageType::Offer, dst, serde_json::to_value(payload)?))
    }

    pub fn answer(dst: &str, payload: &AnswerPayload) -> Result<Self, serde_json::Error> {
        Ok(Self::to(MessageType::Answer, dst, serde_json::to_value(payload)?))
    }

    pub fn candidate(dst: &str, payload: &CandidatePayload) -> Result<Self, serde_json::Error> {
        Ok(Self::to(
            MessageType::Candidate,
            dst,
            serde_json::to_value(payload)?,
        ))
    }

    /// Payload in den erwarteten Typ umwandeln
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.payload
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
    }

    /// Fehlertext aus `payload.msg`
    pub fn error_text(&self) -> String {
        self.parse_payload::<ErrorPayload>()
            .map(|p| p.msg)
            .unwrap_or_else(|| format!("{:?}", self.kind))
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Media,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp,
        }
    }
}

/// SDP Offer für Medien- oder Datenverbindung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

impl OfferPayload {
    pub fn media(connection_id: &str, sdp: String) -> Self {
        Self {
            sdp: SessionDescription::offer(sdp),
            connection_type: ConnectionType::Media,
            connection_id: connection_id.to_string(),
            label: None,
            reliable: None,
            serialization: None,
            metadata: None,
            browser: Some(CLIENT_NAME.to_string()),
        }
    }

    /// Datenkanal mit `raw` Serialisierung, Label = Connection ID
    pub fn data(connection_id: &str, sdp: String) -> Self {
        Self {
            sdp: SessionDescription::offer(sdp),
            connection_type: ConnectionType::Data,
            connection_id: connection_id.to_string(),
            label: Some(connection_id.to_string()),
            reliable: Some(true),
            serialization: Some("raw".to_string()),
            metadata: None,
            browser: Some(CLIENT_NAME.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

impl AnswerPayload {
    pub fn new(connection_type: ConnectionType, connection_id: &str, sdp: String) -> Self {
        Self {
            sdp: SessionDescription::answer(sdp),
            connection_type,
            connection_id: connection_id.to_string(),
            browser: Some(CLIENT_NAME.to_string()),
        }
    }
}

/// ICE Candidate im Browser-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorPayload {
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_open_and_id_taken() {
        let open: Message = serde_json::from_str(r#"{"type":"OPEN"}"#).unwrap();
        assert_eq!(open.kind, MessageType::Open);
        assert!(open.payload.is_none());

        let taken: Message = serde_json::from_str(
            r#"{"type":"ID-TAKEN","payload":{"msg":"ID \"alice\" is taken"}}"#,
        )
        .unwrap();
        assert_eq!(taken.kind, MessageType::IdTaken);
        assert_eq!(taken.error_text(), "ID \"alice\" is taken");
    }

    #[test]
    fn test_heartbeat_serializes_bare() {
        let text = serde_json::to_string(&Message::heartbeat()).unwrap();
        assert_eq!(text, r#"{"type":"HEARTBEAT"}"#);
    }

    #[test]
    fn test_media_offer_wire_format() {
        let msg = Message::offer("bob", &OfferPayload::media("mc_x1", "v=0".into())).unwrap();
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "OFFER",
                "dst": "bob",
                "payload": {
                    "sdp": {"type": "offer", "sdp": "v=0"},
                    "type": "media",
                    "connectionId": "mc_x1",
                    "browser": "peerchat"
                }
            })
        );
    }

    #[test]
    fn test_browser_data_offer_parses() {
        let raw = json!({
            "type": "OFFER",
            "src": "alice",
            "dst": "me",
            "payload": {
                "sdp": {"type": "offer", "sdp": "v=0\r\n"},
                "type": "data",
                "connectionId": "dc_abc",
                "label": "dc_abc",
                "reliable": true,
                "serialization": "binary",
                "metadata": null,
                "browser": "firefox"
            }
        });

        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.src.as_deref(), Some("alice"));
        let offer: OfferPayload = msg.parse_payload().unwrap();
        assert_eq!(offer.connection_type, ConnectionType::Data);
        assert_eq!(offer.connection_id, "dc_abc");
        assert_eq!(offer.serialization.as_deref(), Some("binary"));
        assert_eq!(offer.sdp.kind, "offer");
    }

    #[test]
    fn test_candidate_field_names() {
        let raw = json!({
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            },
            "type": "media",
            "connectionId": "mc_1"
        });

        let payload: CandidatePayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(payload.candidate.sdp_mline_index, Some(0));
        assert!(payload.candidate.username_fragment.is_none());
    }

    #[test]
    fn test_unknown_payload_shape_is_none() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"ANSWER","src":"x","payload":{"foo":1}}"#).unwrap();
        assert!(msg.parse_payload::<AnswerPayload>().is_none());
    }
}
