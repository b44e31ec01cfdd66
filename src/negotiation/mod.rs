pub mod transport;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::{PeerAddress, Role};

/// Why the offer/answer/candidate exchange could not produce (or keep) a
/// media path. Terminal for the session; the user gets a retry affordance.
#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("no viable connectivity path to the peer")]
    NoViablePath,
    #[error("negotiation timed out")]
    Timeout,
    #[error("negotiation transport error: {0}")]
    Internal(String),
}

/// The one-shot session description / candidate exchange, relayed between
/// the two peers through the signaling channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalBody {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
    Bye,
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer { .. } => "offer",
            SignalBody::Answer { .. } => "answer",
            SignalBody::Candidate { .. } => "candidate",
            SignalBody::Bye => "bye",
        }
    }
}

/// A negotiation message as it travels over the wire: payload plus the
/// sender's address and attempt counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationMessage {
    pub from: PeerAddress,
    pub attempt: u64,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl NegotiationMessage {
    /// A message from an attempt older than the receiver's current one is
    /// left over from a superseded negotiation and must be ignored.
    pub fn is_stale(&self, current_attempt: u64) -> bool {
        self.attempt < current_attempt
    }
}

/// Commands into a transport actor. One actor serves exactly one
/// negotiation attempt; a restart means a fresh actor.
#[derive(Debug)]
pub enum TransportCommand {
    /// Initiator only: produce the session's single offer.
    MakeOffer,
    /// Responder only: apply the remote offer and produce the answer.
    AcceptOffer { sdp: String },
    /// Initiator only: apply the remote answer.
    ApplyAnswer { sdp: String },
    AddCandidate { candidate: String },
    /// One 20 ms PCM frame for the outgoing voice track.
    AudioFrame(Vec<f32>),
    /// One JPEG frame for the outgoing video channel.
    VideoFrame(Vec<u8>),
    /// Tell the peer whether our video is flowing.
    SetVideoActive(bool),
    Close,
}

/// Events out of a transport actor, fed into the call engine's queue.
#[derive(Debug)]
pub enum TransportEvent {
    OfferReady { sdp: String },
    AnswerReady { sdp: String },
    CandidateReady { candidate: String },
    /// A live media path to the peer exists.
    Connected,
    /// The media path degraded or died after being established.
    Disconnected,
    Failed(NegotiationError),
    Closed,
    RemoteVideo { active: bool },
    RemoteVideoFrame { jpeg: Vec<u8> },
}

/// What a transport actor needs at spawn time.
pub struct TransportSeed {
    pub role: Role,
    pub attempt: u64,
    pub stun_servers: Vec<String>,
    /// Sink for decoded remote audio; `None` when playback is unavailable.
    pub playback_tx: Option<mpsc::Sender<Vec<f32>>>,
}

/// Channel pair connecting the call engine to one transport actor.
pub struct TransportLink {
    pub command_tx: mpsc::Sender<TransportCommand>,
    pub event_rx: mpsc::Receiver<TransportEvent>,
}

/// Constructor for transport actors. The engine takes this as a value so a
/// scripted transport can stand in for the real one.
pub type TransportFactory = Box<dyn Fn(TransportSeed) -> TransportLink + Send + Sync>;

/// The production factory: STUN-assisted WebRTC transport actors.
pub fn webrtc_factory() -> TransportFactory {
    Box::new(transport::spawn_webrtc_transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Role, SessionKey};

    #[test]
    fn stale_gate_only_drops_older_attempts() {
        let from = SessionKey::new("apt", "p", Role::Initiator).address();
        let msg = |attempt| NegotiationMessage {
            from,
            attempt,
            body: SignalBody::Bye,
        };
        assert!(msg(1).is_stale(2));
        assert!(!msg(2).is_stale(2));
        assert!(!msg(3).is_stale(2));
    }
}
