use serde::Serialize;
use tokio::sync::broadcast;

use crate::call::CloseReason;
use crate::session::PeerAddress;

/// Transport-agnostic session events.
/// Emitted by the call engine, consumed by whatever UI layer is attached.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    PeerJoined { peer: PeerAddress },
    PeerLeft { peer: PeerAddress },
    /// Video acquisition failed but audio-only capture succeeded.
    MediaFallback { error: String },
    LocalVideoChanged { active: bool },
    RemoteVideoChanged { active: bool },
    NegotiationFailed { reason: String },
    CallFailed { reason: String },
    CallClosed { reason: CloseReason },
}

pub type EventSender = broadcast::Sender<SessionEvent>;
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
