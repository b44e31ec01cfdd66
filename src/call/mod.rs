pub mod engine;
pub mod teardown;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::events::{EventReceiver, EventSender};
use crate::media::{AcquiredMedia, MediaError};
use crate::session::PeerAddress;

/// Lifecycle of one participant's consultation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Initializing,
    AcquiringMedia,
    AwaitingPeer,
    Negotiating,
    Connected,
    /// Live audio, lost video.
    Degraded,
    Closed,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Closed | CallState::Failed)
    }

    /// A media path to the peer exists.
    pub fn is_live(&self) -> bool {
        matches!(self, CallState::Connected | CallState::Degraded)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Hangup,
    PeerBye,
    /// The peer dropped out of the room and did not come back in time.
    PeerGone,
    TransportFailed,
}

/// Current session state plus diagnostics, published on every change.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    /// Whether video capture was part of the successful acquisition.
    pub video_capable: bool,
    pub muted: bool,
    pub video_enabled: bool,
    pub remote_video: bool,
    pub remote_peer: Option<PeerAddress>,
    pub remote_display_name: Option<String>,
    /// Set while waiting for the peer, so the UI can show elapsed time.
    pub awaiting_since: Option<DateTime<Utc>>,
    pub attempt: u64,
    pub media_error: Option<String>,
    /// Actionable text to show alongside `media_error`.
    pub media_hint: Option<String>,
    pub failure: Option<String>,
    pub close_reason: Option<CloseReason>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Initializing,
            video_capable: false,
            muted: false,
            video_enabled: false,
            remote_video: false,
            remote_peer: None,
            remote_display_name: None,
            awaiting_since: None,
            attempt: 0,
            media_error: None,
            media_hint: None,
            failure: None,
            close_reason: None,
        }
    }
}

/// User actions on a running session.
#[derive(Debug)]
pub enum CallCommand {
    SetMuted(bool),
    SetVideoEnabled(bool),
    HangUp,
}

/// Opens local capture. Boxed so a scripted acquirer can stand in for the
/// real devices.
pub type MediaAcquirer = Box<dyn Fn(bool) -> Result<AcquiredMedia, MediaError> + Send + Sync>;

/// What the UI layer holds while a session runs.
pub struct CallHandle {
    pub(crate) command_tx: mpsc::Sender<CallCommand>,
    pub snapshot_rx: watch::Receiver<CallSnapshot>,
    pub(crate) event_tx: EventSender,
    pub(crate) remote_frames: Option<mpsc::Receiver<Vec<u8>>>,
}

impl CallHandle {
    pub async fn set_muted(&self, muted: bool) {
        let _ = self.command_tx.send(CallCommand::SetMuted(muted)).await;
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        let _ = self
            .command_tx
            .send(CallCommand::SetVideoEnabled(enabled))
            .await;
    }

    pub async fn hang_up(&self) {
        let _ = self.command_tx.send(CallCommand::HangUp).await;
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    /// Remote JPEG frames for rendering; can be taken once.
    pub fn take_remote_frames(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.remote_frames.take()
    }
}
