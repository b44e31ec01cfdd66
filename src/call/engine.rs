use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::events::{EventSender, SessionEvent};
use crate::media::{self, AcquiredMedia, MediaError, MediaHandle, VideoFrame};
use crate::negotiation::{
    NegotiationError, NegotiationMessage, SignalBody, TransportCommand, TransportEvent,
    TransportFactory, TransportLink, TransportSeed,
};
use crate::rendezvous::{RendezvousCommand, RendezvousEvent, RendezvousLink};
use crate::session::{PeerAddress, Role, SessionKey};

use super::teardown::{SessionResources, Teardown};
use super::{CallCommand, CallSnapshot, CallState, CloseReason, MediaAcquirer};

/// Everything the engine task needs; assembled by `start_session` in
/// production and directly by scenario tests.
pub struct EngineContext {
    pub key: SessionKey,
    pub config: CallConfig,
    pub acquire: MediaAcquirer,
    pub transport_factory: TransportFactory,
    pub rendezvous: RendezvousLink,
    pub command_rx: mpsc::Receiver<CallCommand>,
    pub snapshot_tx: watch::Sender<CallSnapshot>,
    pub event_tx: EventSender,
    pub remote_frame_tx: mpsc::Sender<Vec<u8>>,
    pub remote_display_name: Option<String>,
}

/// One iteration's worth of input, pulled off the serialized queue.
enum Input {
    Command(Option<CallCommand>),
    Rendezvous(Option<RendezvousEvent>),
    Transport(Option<TransportEvent>),
    Capture(Option<Vec<f32>>),
    Camera(Option<VideoFrame>),
    NegotiationTimeout,
    GraceExpired,
}

/// Drive one participant's session from start to teardown.
///
/// All inputs (user commands, room events, negotiation messages,
/// connectivity changes, media frames, timers) are serialized through one
/// queue, so there are no intra-session races to reason about.
pub async fn run_call_engine(ctx: EngineContext) {
    let EngineContext {
        key,
        config,
        acquire,
        transport_factory,
        rendezvous,
        mut command_rx,
        snapshot_tx,
        event_tx,
        remote_frame_tx,
        remote_display_name,
    } = ctx;
    let RendezvousLink {
        command_tx: rendezvous_tx,
        event_rx: mut rendezvous_rx,
    } = rendezvous;

    let mut engine = Engine {
        my_address: key.address(),
        role: key.role,
        config,
        snapshot: CallSnapshot::default(),
        snapshot_tx,
        event_tx,
        rendezvous_tx,
        transport_factory,
        transport_tx: None,
        remote_frame_tx,
        media: None,
        playback_tx: None,
        remote: None,
        attempt: 0,
        had_video: false,
        camera_live: false,
        negotiation_deadline: None,
        grace_deadline: None,
    };
    engine.snapshot.video_enabled = engine.config.want_video;
    engine.snapshot.remote_display_name = remote_display_name;
    info!(appointment_id = %key.appointment_id, role = %key.role, "consultation session starting");

    // Media comes first; everything else waits on it.
    engine.set_state(CallState::AcquiringMedia);
    let want_video = engine.config.want_video;
    let mut acquisition = tokio::task::spawn_blocking(move || acquire_with_fallback(acquire, want_video));

    let mut cancelled = false;
    let outcome = loop {
        tokio::select! {
            result = &mut acquisition => break Some(result),
            command = command_rx.recv() => match command {
                Some(CallCommand::SetMuted(muted)) => {
                    engine.snapshot.muted = muted;
                    engine.publish();
                }
                Some(CallCommand::SetVideoEnabled(enabled)) => {
                    engine.snapshot.video_enabled = enabled;
                    engine.publish();
                }
                Some(CallCommand::HangUp) | None => {
                    cancelled = true;
                    break None;
                }
            },
        }
    };

    if cancelled {
        // The devices may still finish opening after this point; whatever
        // comes back gets released immediately.
        tokio::spawn(async move {
            if let Ok(Ok((mut acquired, _))) = acquisition.await {
                acquired.handle.release();
                debug!("released media that finished acquiring after close");
            }
        });
        engine.close(CloseReason::Hangup).await;
        return;
    }

    let (acquired, fallback) = match outcome.expect("acquisition outcome") {
        Ok(Ok(parts)) => parts,
        Ok(Err(error)) => {
            engine.fail_media(error).await;
            return;
        }
        Err(join_error) => {
            engine
                .fail_media(MediaError::Unknown(join_error.to_string()))
                .await;
            return;
        }
    };

    if let Some(error) = fallback {
        engine.snapshot.media_error = Some(error.to_string());
        engine.snapshot.media_hint = Some(error.user_hint().to_string());
        let _ = engine.event_tx.send(SessionEvent::MediaFallback {
            error: error.to_string(),
        });
    }

    engine.snapshot.video_capable = acquired.has_video();
    engine.camera_live = acquired.has_video();
    engine.snapshot.video_enabled = engine.snapshot.video_enabled && acquired.has_video();

    let AcquiredMedia {
        handle,
        capture_rx,
        playback_tx,
        camera_rx,
    } = acquired;
    engine.media = Some(handle);
    engine.playback_tx = Some(playback_tx);
    let mut capture_rx = Some(capture_rx);
    let mut camera_rx = camera_rx;
    let mut transport_rx: Option<mpsc::Receiver<TransportEvent>> = None;
    let mut rendezvous_open = true;

    // With local media in hand, show up for the appointment.
    let _ = engine.rendezvous_tx.send(RendezvousCommand::Join).await;
    engine.snapshot.awaiting_since = Some(Utc::now());
    engine.set_state(CallState::AwaitingPeer);

    loop {
        // `recv_opt` parks disabled sources forever; a source that yields
        // `None` is cleared by its handler so it cannot spin.
        let negotiation_deadline = engine.negotiation_deadline;
        let grace_deadline = engine.grace_deadline;
        let input = tokio::select! {
            command = command_rx.recv() => Input::Command(command),
            event = rendezvous_rx.recv(), if rendezvous_open => Input::Rendezvous(event),
            event = recv_opt(&mut transport_rx) => Input::Transport(event),
            frame = recv_opt(&mut capture_rx) => Input::Capture(frame),
            frame = recv_opt(&mut camera_rx) => Input::Camera(frame),
            () = sleep_until(negotiation_deadline.unwrap_or_else(far_future)),
                if negotiation_deadline.is_some() => Input::NegotiationTimeout,
            () = sleep_until(grace_deadline.unwrap_or_else(far_future)),
                if grace_deadline.is_some() => Input::GraceExpired,
        };

        match input {
            Input::Command(None) | Input::Command(Some(CallCommand::HangUp)) => {
                engine.close(CloseReason::Hangup).await;
            }
            Input::Command(Some(CallCommand::SetMuted(muted))) => {
                engine.snapshot.muted = muted;
                engine.publish();
            }
            Input::Command(Some(CallCommand::SetVideoEnabled(enabled))) => {
                engine.set_video_enabled(enabled, &mut camera_rx);
            }

            Input::Rendezvous(None) => {
                rendezvous_open = false;
            }
            Input::Rendezvous(Some(event)) => {
                if let Some(rx) = engine.handle_rendezvous(event).await {
                    transport_rx = Some(rx);
                }
            }

            Input::Transport(None) => {
                transport_rx = None;
            }
            Input::Transport(Some(event)) => {
                if !engine.handle_transport(event).await {
                    transport_rx = None;
                }
            }

            Input::Capture(None) => {
                warn!("microphone stream ended");
                capture_rx = None;
            }
            Input::Capture(Some(pcm)) => engine.forward_audio(pcm),

            Input::Camera(None) => {
                camera_rx = None;
                engine.local_video_lost();
            }
            Input::Camera(Some(frame)) => engine.forward_video(frame),

            Input::NegotiationTimeout => {
                engine.fail_negotiation(NegotiationError::Timeout).await;
            }
            Input::GraceExpired => {
                engine.close(CloseReason::PeerGone).await;
            }
        }

        if engine.snapshot.state.is_terminal() {
            break;
        }
    }

    info!("consultation session ended");
}

/// The acquisition policy: one try as asked, then exactly one audio-only
/// retry unless the combined request was refused outright.
fn acquire_with_fallback(
    acquire: MediaAcquirer,
    want_video: bool,
) -> Result<(AcquiredMedia, Option<MediaError>), MediaError> {
    match acquire(want_video) {
        Ok(media) => Ok((media, None)),
        Err(error) if want_video && !matches!(error, MediaError::PermissionDenied(_)) => {
            warn!("capture with video failed ({}), retrying audio only", error);
            match acquire(false) {
                Ok(media) => Ok((media, Some(error))),
                Err(second) => Err(second),
            }
        }
        Err(error) => Err(error),
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

struct Engine {
    my_address: PeerAddress,
    role: Role,
    config: CallConfig,
    snapshot: CallSnapshot,
    snapshot_tx: watch::Sender<CallSnapshot>,
    event_tx: EventSender,
    rendezvous_tx: mpsc::Sender<RendezvousCommand>,
    transport_factory: TransportFactory,
    transport_tx: Option<mpsc::Sender<TransportCommand>>,
    remote_frame_tx: mpsc::Sender<Vec<u8>>,
    media: Option<MediaHandle>,
    playback_tx: Option<mpsc::Sender<Vec<f32>>>,
    remote: Option<PeerAddress>,
    attempt: u64,
    /// Whether video has ever flowed in this session; a session that never
    /// had video is plain audio, not degraded.
    had_video: bool,
    camera_live: bool,
    negotiation_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
}

impl Engine {
    fn set_state(&mut self, state: CallState) {
        if self.snapshot.state != state {
            info!(from = ?self.snapshot.state, to = ?state, "call state");
            self.snapshot.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.snapshot.clone());
    }

    fn local_video_active(&self) -> bool {
        self.camera_live && self.snapshot.video_enabled
    }

    // ------------------------------------------------------------------
    // rendezvous events
    // ------------------------------------------------------------------

    async fn handle_rendezvous(
        &mut self,
        event: RendezvousEvent,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        match event {
            RendezvousEvent::Joined { peers } => {
                let mut installed = None;
                for peer in peers {
                    if let Some(rx) = self.peer_joined(peer) {
                        installed = Some(rx);
                    }
                }
                installed
            }
            RendezvousEvent::PeerJoined { peer } => self.peer_joined(peer),
            RendezvousEvent::PeerLeft { peer } => {
                let _ = self.event_tx.send(SessionEvent::PeerLeft { peer });
                if self.remote == Some(peer) && !self.snapshot.state.is_terminal() {
                    debug!(%peer, "peer dropped out, starting grace window");
                    self.grace_deadline = Some(Instant::now() + self.config.peer_left_grace);
                }
                None
            }
            RendezvousEvent::Signal(message) => self.handle_signal(message).await,
            RendezvousEvent::Rejected(error) => {
                self.fail(format!("rendezvous refused: {}", error)).await;
                None
            }
            RendezvousEvent::Lost(error) => {
                if self.snapshot.state.is_live() {
                    // The media path stands on its own; losing signaling
                    // only costs us the goodbye later.
                    warn!("rendezvous link lost mid-call: {}", error);
                } else {
                    self.fail(format!("rendezvous lost: {}", error)).await;
                }
                None
            }
        }
    }

    fn peer_joined(&mut self, peer: PeerAddress) -> Option<mpsc::Receiver<TransportEvent>> {
        if peer == self.my_address {
            return None;
        }
        let rejoined = self.remote == Some(peer);
        if self.remote.is_none() {
            self.remote = Some(peer);
            self.snapshot.remote_peer = Some(peer);
        } else if !rejoined {
            // A two-party room cannot produce this; drop it.
            warn!(%peer, "unexpected third address announced, ignoring");
            return None;
        }
        self.grace_deadline = None;
        let _ = self.event_tx.send(SessionEvent::PeerJoined { peer });

        match self.snapshot.state {
            CallState::AwaitingPeer => {
                self.snapshot.awaiting_since = None;
                if self.role == Role::Initiator {
                    Some(self.begin_negotiation())
                } else {
                    // The responder enters negotiation passively and waits
                    // for the initiator's offer.
                    self.negotiation_deadline =
                        Some(Instant::now() + self.config.negotiating_timeout);
                    self.set_state(CallState::Negotiating);
                    None
                }
            }
            CallState::Negotiating if rejoined && self.role == Role::Initiator => {
                // The peer re-registered mid-negotiation; the old exchange
                // is dead, start a fresh attempt.
                info!("peer re-registered, restarting negotiation");
                Some(self.begin_negotiation())
            }
            _ => None,
        }
    }

    async fn handle_signal(
        &mut self,
        message: NegotiationMessage,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        if message.is_stale(self.attempt) {
            // Leftover from a superseded attempt; expected during
            // reconnects, never surfaced.
            debug!(
                kind = message.body.kind(),
                attempt = message.attempt,
                current = self.attempt,
                "stale negotiation message dropped"
            );
            return None;
        }

        match message.body {
            SignalBody::Offer { sdp } => {
                if self.role != Role::Responder {
                    debug!("offer received by the initiator, dropped");
                    return None;
                }
                if self.transport_tx.is_some() && message.attempt == self.attempt {
                    debug!("duplicate offer for the current attempt, dropped");
                    return None;
                }
                // Adopt the initiator's attempt; it supersedes whatever
                // exchange we were part of.
                self.close_transport();
                self.attempt = message.attempt;
                self.snapshot.attempt = self.attempt;
                let rx = self.create_transport();
                self.send_transport(TransportCommand::AcceptOffer { sdp });
                self.negotiation_deadline = Some(Instant::now() + self.config.negotiating_timeout);
                self.set_state(CallState::Negotiating);
                Some(rx)
            }
            SignalBody::Answer { sdp } => {
                if self.role == Role::Initiator && message.attempt == self.attempt {
                    self.send_transport(TransportCommand::ApplyAnswer { sdp });
                } else {
                    debug!("answer dropped (wrong role or attempt)");
                }
                None
            }
            SignalBody::Candidate { candidate } => {
                if message.attempt == self.attempt && self.transport_tx.is_some() {
                    self.send_transport(TransportCommand::AddCandidate { candidate });
                } else {
                    debug!("candidate dropped (attempt {})", message.attempt);
                }
                None
            }
            SignalBody::Bye => {
                info!("peer said goodbye");
                self.close(CloseReason::PeerBye).await;
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // negotiation transport
    // ------------------------------------------------------------------

    /// Start a fresh negotiation attempt as the initiator.
    fn begin_negotiation(&mut self) -> mpsc::Receiver<TransportEvent> {
        self.close_transport();
        self.attempt += 1;
        self.snapshot.attempt = self.attempt;
        let rx = self.create_transport();
        self.send_transport(TransportCommand::MakeOffer);
        self.negotiation_deadline = Some(Instant::now() + self.config.negotiating_timeout);
        self.set_state(CallState::Negotiating);
        rx
    }

    fn create_transport(&mut self) -> mpsc::Receiver<TransportEvent> {
        let seed = TransportSeed {
            role: self.role,
            attempt: self.attempt,
            stun_servers: self.config.stun_servers.clone(),
            playback_tx: self.playback_tx.clone(),
        };
        let TransportLink {
            command_tx,
            event_rx,
        } = (self.transport_factory)(seed);
        self.transport_tx = Some(command_tx);
        // Make sure the peer learns our video state as soon as the channel
        // opens.
        self.send_transport(TransportCommand::SetVideoActive(self.local_video_active()));
        event_rx
    }

    fn close_transport(&mut self) {
        if let Some(transport) = self.transport_tx.take() {
            let _ = transport.try_send(TransportCommand::Close);
        }
    }

    fn send_transport(&self, command: TransportCommand) {
        if let Some(transport) = &self.transport_tx {
            if transport.try_send(command).is_err() {
                debug!("transport command queue full, dropped");
            }
        }
    }

    fn send_signal(&self, body: SignalBody) {
        let Some(to) = self.remote else {
            debug!("no peer to signal yet");
            return;
        };
        let message = NegotiationMessage {
            from: self.my_address,
            attempt: self.attempt,
            body,
        };
        if self
            .rendezvous_tx
            .try_send(RendezvousCommand::Signal { to, message })
            .is_err()
        {
            warn!("signaling queue full, message dropped");
        }
    }

    /// Returns false once the transport's event stream should be dropped.
    async fn handle_transport(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::OfferReady { sdp } => {
                self.send_signal(SignalBody::Offer { sdp });
                true
            }
            TransportEvent::AnswerReady { sdp } => {
                self.send_signal(SignalBody::Answer { sdp });
                true
            }
            TransportEvent::CandidateReady { candidate } => {
                self.send_signal(SignalBody::Candidate { candidate });
                true
            }
            TransportEvent::Connected => {
                self.negotiation_deadline = None;
                if self.local_video_active() {
                    self.had_video = true;
                }
                self.set_state(CallState::Connected);
                self.recompute_live_state();
                true
            }
            TransportEvent::Disconnected => {
                if self.snapshot.state.is_live() {
                    self.close(CloseReason::TransportFailed).await;
                }
                // While negotiating this is transient; the deadline decides.
                true
            }
            TransportEvent::Failed(error) => {
                if self.snapshot.state.is_live() {
                    self.close(CloseReason::TransportFailed).await;
                } else {
                    self.fail_negotiation(error).await;
                }
                false
            }
            TransportEvent::Closed => {
                if !self.snapshot.state.is_terminal() && self.transport_tx.is_some() {
                    // The transport went away under us.
                    self.close(CloseReason::TransportFailed).await;
                }
                false
            }
            TransportEvent::RemoteVideo { active } => {
                if self.snapshot.remote_video != active {
                    self.snapshot.remote_video = active;
                    if active {
                        self.had_video = true;
                    }
                    let _ = self
                        .event_tx
                        .send(SessionEvent::RemoteVideoChanged { active });
                    self.recompute_live_state();
                    self.publish();
                }
                true
            }
            TransportEvent::RemoteVideoFrame { jpeg } => {
                let _ = self.remote_frame_tx.try_send(jpeg);
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // local media flow
    // ------------------------------------------------------------------

    fn forward_audio(&self, pcm: Vec<f32>) {
        if self.snapshot.muted {
            return;
        }
        self.send_transport(TransportCommand::AudioFrame(pcm));
    }

    fn forward_video(&self, frame: VideoFrame) {
        if !self.snapshot.video_enabled {
            return;
        }
        self.send_transport(TransportCommand::VideoFrame(frame.jpeg_data));
    }

    fn local_video_lost(&mut self) {
        let was_active = self.local_video_active();
        self.camera_live = false;
        if was_active {
            warn!("local camera stopped producing frames");
            self.send_transport(TransportCommand::SetVideoActive(false));
            let _ = self
                .event_tx
                .send(SessionEvent::LocalVideoChanged { active: false });
            self.recompute_live_state();
            self.publish();
        }
    }

    fn set_video_enabled(
        &mut self,
        enabled: bool,
        camera_rx: &mut Option<mpsc::Receiver<VideoFrame>>,
    ) {
        if enabled == self.snapshot.video_enabled {
            return;
        }

        if !enabled {
            self.snapshot.video_enabled = false;
            if let Some(media) = &mut self.media {
                media.stop_camera();
            }
            *camera_rx = None;
            self.camera_live = false;
            self.send_transport(TransportCommand::SetVideoActive(false));
            let _ = self
                .event_tx
                .send(SessionEvent::LocalVideoChanged { active: false });
        } else {
            if !self.camera_live {
                // Best effort; a camera that disappeared mid-session may
                // simply not come back.
                match media::video::start_camera(None) {
                    Ok((handle, rx)) => {
                        if let Some(media) = &mut self.media {
                            media.set_camera(handle);
                        }
                        *camera_rx = Some(rx);
                        self.camera_live = true;
                        self.snapshot.video_capable = true;
                    }
                    Err(error) => {
                        warn!("could not re-open camera: {}", error);
                        self.publish();
                        return;
                    }
                }
            }
            self.snapshot.video_enabled = true;
            self.had_video = true;
            self.send_transport(TransportCommand::SetVideoActive(true));
            let _ = self
                .event_tx
                .send(SessionEvent::LocalVideoChanged { active: true });
        }

        self.recompute_live_state();
        self.publish();
    }

    /// Connected vs. degraded, once a media path exists: a session that has
    /// had video and currently has none anywhere is degraded.
    fn recompute_live_state(&mut self) {
        if !self.snapshot.state.is_live() {
            return;
        }
        let video_somewhere = self.local_video_active() || self.snapshot.remote_video;
        if video_somewhere {
            self.had_video = true;
        }
        let next = if video_somewhere || !self.had_video {
            CallState::Connected
        } else {
            CallState::Degraded
        };
        if next != self.snapshot.state {
            self.set_state(next);
        }
    }

    // ------------------------------------------------------------------
    // endings
    // ------------------------------------------------------------------

    async fn close(&mut self, reason: CloseReason) {
        if self.snapshot.state.is_terminal() {
            return;
        }
        info!(?reason, "closing session");
        self.snapshot.close_reason = Some(reason);
        self.set_state(CallState::Closed);
        let _ = self.event_tx.send(SessionEvent::CallClosed { reason });
        self.run_teardown().await;
    }

    async fn fail(&mut self, reason: String) {
        if self.snapshot.state.is_terminal() {
            return;
        }
        warn!("session failed: {}", reason);
        self.snapshot.failure = Some(reason.clone());
        self.set_state(CallState::Failed);
        let _ = self.event_tx.send(SessionEvent::CallFailed { reason });
        self.run_teardown().await;
    }

    async fn fail_negotiation(&mut self, error: NegotiationError) {
        if self.snapshot.state.is_terminal() {
            return;
        }
        self.negotiation_deadline = None;
        let _ = self.event_tx.send(SessionEvent::NegotiationFailed {
            reason: error.to_string(),
        });
        self.fail(format!("negotiation failed: {}", error)).await;
    }

    async fn fail_media(&mut self, error: MediaError) {
        self.snapshot.media_error = Some(error.to_string());
        self.snapshot.media_hint = Some(error.user_hint().to_string());
        self.fail(format!("media acquisition failed: {}", error))
            .await;
    }

    async fn run_teardown(&mut self) {
        let resources = SessionResources {
            bye: self
                .remote
                .map(|to| (self.rendezvous_tx.clone(), self.my_address, self.attempt, to)),
            media: self.media.take(),
            transport: self.transport_tx.take(),
            rendezvous: Some(self.rendezvous_tx.clone()),
        };
        Teardown::new(resources).run().await;
    }
}
