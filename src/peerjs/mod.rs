//! PeerJS Module - Provider über einen PeerJS Broker
//!
//! Dieses Modul verwaltet:
//! - WebSocket-Verbindung zum Broker (Registrierung, Heartbeat)
//! - Das JSON Nachrichtenformat des Brokers
//! - WebRTC Peer Connections für Medien und Daten

pub mod client;
pub mod config;
pub mod connection;
pub mod messages;
pub mod provider;

pub use client::{SignalingClient, SignalingError, SignalingEvent, SignalingSender};
pub use config::{ConfigError, IceServer, PeerConfig};
pub use connection::PeerLink;
pub use messages::{ConnectionType, Message, MessageType};
pub use provider::{DataConnection, MediaCall, PeerJsProvider};
