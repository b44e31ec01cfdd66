pub mod client;
pub mod registry;
pub mod server;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::negotiation::NegotiationMessage;
use crate::session::PeerAddress;

/// Rendezvous failures. Room state lives only in relay memory, so most of
/// these are recoverable by re-joining with the same address.
#[derive(Debug, Clone, Error)]
pub enum RendezvousError {
    #[error("consultation room is already full")]
    RoomFull,
    #[error("not authorized for this consultation: {0}")]
    NotAuthorized(String),
    #[error("relay connection lost: {0}")]
    TransportLost(String),
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

/// What other members of a room did, as seen by one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    PeerJoined(PeerAddress),
    PeerLeft(PeerAddress),
}

/// Error classes carried in relay `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RoomFull,
    NotAuthorized,
    BadRequest,
}

/// Client-to-relay frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Join {
        appointment_id: String,
        peer: PeerAddress,
    },
    Leave {
        appointment_id: String,
        peer: PeerAddress,
    },
    Signal {
        to: PeerAddress,
        message: NegotiationMessage,
    },
}

/// Relay-to-client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Join accepted; `peers` lists members already present.
    Joined { peers: Vec<PeerAddress> },
    PeerJoined { peer: PeerAddress },
    PeerLeft { peer: PeerAddress },
    Signal { message: NegotiationMessage },
    Error { kind: ErrorKind, message: String },
}

/// Commands from the call engine to its relay link actor.
#[derive(Debug)]
pub enum RendezvousCommand {
    /// Connect to the relay and register in the appointment's room.
    Join,
    Leave,
    Signal {
        to: PeerAddress,
        message: NegotiationMessage,
    },
}

/// Events from the relay link actor into the call engine's queue.
#[derive(Debug)]
pub enum RendezvousEvent {
    /// Registered; `peers` are the members already in the room.
    Joined { peers: Vec<PeerAddress> },
    PeerJoined { peer: PeerAddress },
    PeerLeft { peer: PeerAddress },
    Signal(NegotiationMessage),
    /// The relay refused us (room full, not authorized).
    Rejected(RendezvousError),
    /// The relay connection died and the bounded reconnect failed.
    Lost(RendezvousError),
}

/// Channel pair connecting the call engine to one relay link actor.
pub struct RendezvousLink {
    pub command_tx: mpsc::Sender<RendezvousCommand>,
    pub event_rx: mpsc::Receiver<RendezvousEvent>,
}
