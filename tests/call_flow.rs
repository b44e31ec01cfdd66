//! Scenario tests for the call state machine, driven through scripted
//! media, transport, and rendezvous stand-ins that speak the same channel
//! contracts as the real collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use televisit::call::{CallHandle, CallSnapshot, CallState, CloseReason, MediaAcquirer};
use televisit::config::CallConfig;
use televisit::media::{AcquiredMedia, MediaError, MediaHandle, ReleaseProbe, VideoFrame};
use televisit::negotiation::{
    NegotiationMessage, SignalBody, TransportCommand, TransportEvent, TransportFactory,
    TransportLink, TransportSeed,
};
use televisit::rendezvous::{RendezvousCommand, RendezvousError, RendezvousEvent, RendezvousLink};
use televisit::session::{PeerAddress, Role, SessionKey};
use televisit::{start_session_with, SessionDeps};

const WAIT: Duration = Duration::from_secs(2);

fn patient_key() -> SessionKey {
    SessionKey::new("apt-1", "patient-1", Role::Initiator)
}

fn provider_key() -> SessionKey {
    SessionKey::new("apt-1", "provider-1", Role::Responder)
}

fn test_config() -> CallConfig {
    CallConfig {
        relay_url: "ws://unused.invalid/ws".into(),
        negotiating_timeout: Duration::from_secs(5),
        peer_left_grace: Duration::from_millis(200),
        ..CallConfig::default()
    }
}

/// The live ends of a scripted acquisition, kept by the test so channels
/// stay open for the session's lifetime.
struct FakeMediaHooks {
    _capture_tx: mpsc::Sender<Vec<f32>>,
    _playback_rx: mpsc::Receiver<Vec<f32>>,
    _camera_tx: Option<mpsc::Sender<VideoFrame>>,
    probe: ReleaseProbe,
}

fn fake_media(video: bool) -> (AcquiredMedia, FakeMediaHooks) {
    let (capture_tx, capture_rx) = mpsc::channel(64);
    let (playback_tx, playback_rx) = mpsc::channel(64);
    let (camera_tx, camera_rx) = if video {
        let (tx, rx) = mpsc::channel::<VideoFrame>(16);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let handle = MediaHandle::new(None, None, None);
    let probe = handle.release_probe();
    (
        AcquiredMedia {
            handle,
            capture_rx,
            playback_tx,
            camera_rx,
        },
        FakeMediaHooks {
            _capture_tx: capture_tx,
            _playback_rx: playback_rx,
            _camera_tx: camera_tx,
            probe,
        },
    )
}

/// Acquirer that always succeeds, with or without video.
fn media_acquirer(video: bool) -> (MediaAcquirer, Arc<Mutex<Option<FakeMediaHooks>>>) {
    let slot = Arc::new(Mutex::new(None));
    let hooks_slot = slot.clone();
    let acquire: MediaAcquirer = Box::new(move |want_video| {
        let (media, hooks) = fake_media(want_video && video);
        *hooks_slot.lock().unwrap() = Some(hooks);
        Ok(media)
    });
    (acquire, slot)
}

/// One scripted transport actor as the engine sees it.
struct FakeTransport {
    role: Role,
    attempt: u64,
    cmd_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
}

fn fake_transport_factory() -> (TransportFactory, mpsc::Receiver<FakeTransport>) {
    let (hooks_tx, hooks_rx) = mpsc::channel(8);
    let factory: TransportFactory = Box::new(move |seed: TransportSeed| {
        let (command_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let _ = hooks_tx.try_send(FakeTransport {
            role: seed.role,
            attempt: seed.attempt,
            cmd_rx,
            event_tx,
        });
        TransportLink {
            command_tx,
            event_rx,
        }
    });
    (factory, hooks_rx)
}

struct Rig {
    handle: CallHandle,
    rdv_cmds: mpsc::Receiver<RendezvousCommand>,
    rdv_events: mpsc::Sender<RendezvousEvent>,
    transports: mpsc::Receiver<FakeTransport>,
}

fn rig(key: SessionKey, config: CallConfig, acquire: MediaAcquirer) -> Rig {
    let (rdv_cmd_tx, rdv_cmds) = mpsc::channel(64);
    let (rdv_events, rdv_event_rx) = mpsc::channel(64);
    let (transport_factory, transports) = fake_transport_factory();
    let handle = start_session_with(
        key,
        config,
        SessionDeps {
            acquire,
            transport_factory,
            rendezvous: RendezvousLink {
                command_tx: rdv_cmd_tx,
                event_rx: rdv_event_rx,
            },
            remote_display_name: None,
        },
    );
    Rig {
        handle,
        rdv_cmds,
        rdv_events,
        transports,
    }
}

async fn wait_for_state(snapshot_rx: &mut watch::Receiver<CallSnapshot>, want: CallState) -> CallSnapshot {
    timeout(WAIT, async {
        loop {
            {
                let snapshot = snapshot_rx.borrow();
                if snapshot.state == want {
                    return snapshot.clone();
                }
                assert!(
                    !snapshot.state.is_terminal(),
                    "session reached {:?} while waiting for {:?}",
                    snapshot.state,
                    want
                );
            }
            snapshot_rx
                .changed()
                .await
                .expect("engine exited before reaching the wanted state");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", want))
}

async fn next_rdv(rig: &mut Rig) -> RendezvousCommand {
    timeout(WAIT, rig.rdv_cmds.recv())
        .await
        .expect("timed out waiting for a rendezvous command")
        .expect("rendezvous command channel closed")
}

async fn next_transport(rig: &mut Rig) -> FakeTransport {
    timeout(WAIT, rig.transports.recv())
        .await
        .expect("timed out waiting for a transport to be created")
        .expect("transport factory dropped")
}

async fn next_cmd(transport: &mut FakeTransport) -> TransportCommand {
    timeout(WAIT, transport.cmd_rx.recv())
        .await
        .expect("timed out waiting for a transport command")
        .expect("transport command channel closed")
}

fn signal(from: PeerAddress, attempt: u64, body: SignalBody) -> RendezvousEvent {
    RendezvousEvent::Signal(NegotiationMessage {
        from,
        attempt,
        body,
    })
}

/// Walk an initiator rig up to `Negotiating` with a transport in hand.
/// Consumes the Join command and the transport's first two commands
/// (video status + offer request).
async fn start_negotiating(rig: &mut Rig) -> FakeTransport {
    let provider = provider_key().address();
    assert!(matches!(next_rdv(rig).await, RendezvousCommand::Join));

    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    wait_for_state(&mut snapshot_rx, CallState::AwaitingPeer).await;

    rig.rdv_events
        .send(RendezvousEvent::PeerJoined { peer: provider })
        .await
        .unwrap();

    let mut transport = next_transport(rig).await;
    assert_eq!(transport.role, Role::Initiator);
    assert_eq!(transport.attempt, 1);
    assert!(matches!(
        next_cmd(&mut transport).await,
        TransportCommand::SetVideoActive(_)
    ));
    assert!(matches!(
        next_cmd(&mut transport).await,
        TransportCommand::MakeOffer
    ));
    wait_for_state(&mut snapshot_rx, CallState::Negotiating).await;
    transport
}

async fn connect(rig: &mut Rig, transport: &FakeTransport) {
    transport.event_tx.send(TransportEvent::Connected).await.unwrap();
    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    wait_for_state(&mut snapshot_rx, CallState::Connected).await;
}

// ----------------------------------------------------------------------
// scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn initiator_connects_and_hangs_up_cleanly() {
    let (acquire, media) = media_acquirer(true);
    let mut rig = rig(patient_key(), test_config(), acquire);
    let provider = provider_key().address();

    let mut transport = start_negotiating(&mut rig).await;

    // The offer goes out through signaling with the current attempt.
    transport
        .event_tx
        .send(TransportEvent::OfferReady {
            sdp: "offer-sdp".into(),
        })
        .await
        .unwrap();
    match next_rdv(&mut rig).await {
        RendezvousCommand::Signal { to, message } => {
            assert_eq!(to, provider);
            assert_eq!(message.attempt, 1);
            assert!(matches!(message.body, SignalBody::Offer { .. }));
        }
        other => panic!("expected an offer signal, got {:?}", other),
    }

    // The answer comes back and is applied.
    rig.rdv_events
        .send(signal(provider, 1, SignalBody::Answer { sdp: "answer".into() }))
        .await
        .unwrap();
    assert!(matches!(
        next_cmd(&mut transport).await,
        TransportCommand::ApplyAnswer { .. }
    ));

    connect(&mut rig, &transport).await;

    rig.handle.hang_up().await;
    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    timeout(WAIT, async {
        loop {
            if snapshot_rx.borrow().state == CallState::Closed {
                break;
            }
            snapshot_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("session did not close");

    assert_eq!(rig.handle.snapshot().close_reason, Some(CloseReason::Hangup));

    // Teardown: goodbye, then room departure; transport told to close;
    // devices released.
    match next_rdv(&mut rig).await {
        RendezvousCommand::Signal { message, .. } => {
            assert!(matches!(message.body, SignalBody::Bye))
        }
        other => panic!("expected the goodbye, got {:?}", other),
    }
    assert!(matches!(next_rdv(&mut rig).await, RendezvousCommand::Leave));

    let close_seen = timeout(WAIT, async {
        loop {
            match transport.cmd_rx.recv().await {
                Some(TransportCommand::Close) => break true,
                Some(_) => continue,
                None => break false,
            }
        }
    })
    .await
    .unwrap();
    assert!(close_seen, "transport was not closed");
    assert!(media.lock().unwrap().as_ref().unwrap().probe.is_released());
}

#[tokio::test]
async fn responder_waits_for_the_offer_and_answers() {
    let (acquire, _media) = media_acquirer(true);
    let mut rig = rig(provider_key(), test_config(), acquire);
    let patient = patient_key().address();

    assert!(matches!(next_rdv(&mut rig).await, RendezvousCommand::Join));
    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    wait_for_state(&mut snapshot_rx, CallState::AwaitingPeer).await;

    // The patient is already in the room.
    rig.rdv_events
        .send(RendezvousEvent::Joined {
            peers: vec![patient],
        })
        .await
        .unwrap();
    wait_for_state(&mut snapshot_rx, CallState::Negotiating).await;

    // A responder never places the call: no transport, no outbound offer.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        rig.transports.try_recv().is_err(),
        "responder built a transport before any offer arrived"
    );
    assert!(
        rig.rdv_cmds.try_recv().is_err(),
        "responder sent signaling before any offer arrived"
    );

    // The initiator's offer arrives; only now does negotiation run.
    rig.rdv_events
        .send(signal(patient, 1, SignalBody::Offer { sdp: "offer".into() }))
        .await
        .unwrap();
    let mut transport = next_transport(&mut rig).await;
    assert_eq!(transport.role, Role::Responder);
    assert_eq!(transport.attempt, 1);
    assert!(matches!(
        next_cmd(&mut transport).await,
        TransportCommand::SetVideoActive(_)
    ));
    assert!(matches!(
        next_cmd(&mut transport).await,
        TransportCommand::AcceptOffer { .. }
    ));

    transport
        .event_tx
        .send(TransportEvent::AnswerReady {
            sdp: "answer".into(),
        })
        .await
        .unwrap();
    match next_rdv(&mut rig).await {
        RendezvousCommand::Signal { to, message } => {
            assert_eq!(to, patient);
            assert!(matches!(message.body, SignalBody::Answer { .. }));
        }
        other => panic!("expected an answer signal, got {:?}", other),
    }
}

#[tokio::test]
async fn stale_attempt_messages_never_reach_the_transport() {
    let (acquire, _media) = media_acquirer(true);
    let mut rig = rig(patient_key(), test_config(), acquire);
    let provider = provider_key().address();

    let mut transport = start_negotiating(&mut rig).await;

    // Attempt 0 predates this negotiation; it must be swallowed.
    rig.rdv_events
        .send(signal(provider, 0, SignalBody::Candidate { candidate: "old".into() }))
        .await
        .unwrap();
    // A current-attempt candidate right behind it must pass through.
    rig.rdv_events
        .send(signal(provider, 1, SignalBody::Candidate { candidate: "new".into() }))
        .await
        .unwrap();

    match next_cmd(&mut transport).await {
        TransportCommand::AddCandidate { candidate } => assert_eq!(candidate, "new"),
        other => panic!("expected only the fresh candidate, got {:?}", other),
    }
}

#[tokio::test]
async fn busy_camera_falls_back_to_audio_only() {
    let calls = Arc::new(AtomicUsize::new(0));
    let call_count = calls.clone();
    let acquire: MediaAcquirer = Box::new(move |want_video| {
        call_count.fetch_add(1, Ordering::SeqCst);
        if want_video {
            Err(MediaError::DeviceBusy("camera is in use".into()))
        } else {
            Ok(fake_media(false).0)
        }
    });

    let mut rig = rig(patient_key(), test_config(), acquire);
    assert!(matches!(next_rdv(&mut rig).await, RendezvousCommand::Join));

    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    let snapshot = wait_for_state(&mut snapshot_rx, CallState::AwaitingPeer).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!snapshot.video_capable);
    assert!(snapshot.media_error.is_some());

    // Video is never advertised for this session.
    rig.rdv_events
        .send(RendezvousEvent::PeerJoined {
            peer: provider_key().address(),
        })
        .await
        .unwrap();
    let mut transport = next_transport(&mut rig).await;
    assert!(matches!(
        next_cmd(&mut transport).await,
        TransportCommand::SetVideoActive(false)
    ));
}

#[tokio::test]
async fn permission_denied_is_terminal_without_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let call_count = calls.clone();
    let acquire: MediaAcquirer = Box::new(move |_want_video| {
        call_count.fetch_add(1, Ordering::SeqCst);
        Err(MediaError::PermissionDenied("capture blocked".into()))
    });

    let rig = rig(patient_key(), test_config(), acquire);
    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    timeout(WAIT, async {
        loop {
            if snapshot_rx.borrow().state == CallState::Failed {
                break;
            }
            snapshot_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("session did not fail");

    assert_eq!(calls.load(Ordering::SeqCst), 1, "no audio retry after a permission refusal");
    let snapshot = rig.handle.snapshot();
    assert!(snapshot.media_error.unwrap().contains("permission"));
    assert!(snapshot.media_hint.is_some());
}

#[tokio::test]
async fn remote_video_loss_degrades_and_recovery_restores() {
    let (acquire, _media) = media_acquirer(false);
    let mut config = test_config();
    config.want_video = false;
    let mut rig = rig(patient_key(), config, acquire);

    let transport = start_negotiating(&mut rig).await;
    connect(&mut rig, &transport).await;

    let mut snapshot_rx = rig.handle.snapshot_rx.clone();

    // Remote video shows up, then dies: audio-only but still live.
    transport
        .event_tx
        .send(TransportEvent::RemoteVideo { active: true })
        .await
        .unwrap();
    transport
        .event_tx
        .send(TransportEvent::RemoteVideo { active: false })
        .await
        .unwrap();
    let snapshot = wait_for_state(&mut snapshot_rx, CallState::Degraded).await;
    assert!(!snapshot.remote_video);

    // Best-effort recovery.
    transport
        .event_tx
        .send(TransportEvent::RemoteVideo { active: true })
        .await
        .unwrap();
    wait_for_state(&mut snapshot_rx, CallState::Connected).await;
}

#[tokio::test]
async fn audio_only_both_sides_is_connected_not_degraded() {
    let (acquire, _media) = media_acquirer(false);
    let mut config = test_config();
    config.want_video = false;
    let mut rig = rig(patient_key(), config, acquire);

    let transport = start_negotiating(&mut rig).await;
    connect(&mut rig, &transport).await;

    // No video ever flowed; the session is plainly connected.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.handle.snapshot().state, CallState::Connected);
}

#[tokio::test]
async fn peer_left_without_rejoin_closes_after_grace() {
    let (acquire, media) = media_acquirer(true);
    let mut rig = rig(patient_key(), test_config(), acquire);
    let provider = provider_key().address();

    let transport = start_negotiating(&mut rig).await;
    connect(&mut rig, &transport).await;

    rig.rdv_events
        .send(RendezvousEvent::PeerLeft { peer: provider })
        .await
        .unwrap();

    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    timeout(WAIT, async {
        loop {
            if snapshot_rx.borrow().state == CallState::Closed {
                break;
            }
            snapshot_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("session did not close after the grace window");

    assert_eq!(rig.handle.snapshot().close_reason, Some(CloseReason::PeerGone));
    assert!(media.lock().unwrap().as_ref().unwrap().probe.is_released());
}

#[tokio::test]
async fn peer_rejoin_within_grace_restarts_negotiation() {
    let (acquire, _media) = media_acquirer(true);
    let mut rig = rig(patient_key(), test_config(), acquire);
    let provider = provider_key().address();

    let mut first = start_negotiating(&mut rig).await;

    // The peer's registration blips while negotiating.
    rig.rdv_events
        .send(RendezvousEvent::PeerLeft { peer: provider })
        .await
        .unwrap();
    rig.rdv_events
        .send(RendezvousEvent::PeerJoined { peer: provider })
        .await
        .unwrap();

    // A fresh transport with a higher attempt supersedes the old one.
    let mut second = next_transport(&mut rig).await;
    assert_eq!(second.attempt, 2);
    assert!(matches!(
        next_cmd(&mut second).await,
        TransportCommand::SetVideoActive(_)
    ));
    assert!(matches!(
        next_cmd(&mut second).await,
        TransportCommand::MakeOffer
    ));
    assert!(matches!(
        next_cmd(&mut first).await,
        TransportCommand::Close
    ));

    // And the session survived the blip.
    assert_eq!(rig.handle.snapshot().state, CallState::Negotiating);
}

#[tokio::test]
async fn peer_bye_closes_the_session() {
    let (acquire, _media) = media_acquirer(true);
    let mut rig = rig(patient_key(), test_config(), acquire);
    let provider = provider_key().address();

    let transport = start_negotiating(&mut rig).await;
    connect(&mut rig, &transport).await;

    rig.rdv_events
        .send(signal(provider, 1, SignalBody::Bye))
        .await
        .unwrap();

    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    timeout(WAIT, async {
        loop {
            if snapshot_rx.borrow().state == CallState::Closed {
                break;
            }
            snapshot_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("session did not close on the peer's goodbye");
    assert_eq!(rig.handle.snapshot().close_reason, Some(CloseReason::PeerBye));
}

#[tokio::test]
async fn negotiation_without_connectivity_times_out_into_failed() {
    let (acquire, _media) = media_acquirer(true);
    let mut config = test_config();
    config.negotiating_timeout = Duration::from_millis(300);
    let mut rig = rig(patient_key(), config, acquire);

    let _transport = start_negotiating(&mut rig).await;

    // Nobody ever reports a live path.
    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    timeout(WAIT, async {
        loop {
            if snapshot_rx.borrow().state == CallState::Failed {
                break;
            }
            snapshot_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("negotiation hung instead of timing out");

    let snapshot = rig.handle.snapshot();
    assert!(snapshot.failure.unwrap().contains("timed out"));
}

#[tokio::test]
async fn room_rejection_fails_the_session() {
    let (acquire, _media) = media_acquirer(true);
    let mut rig = rig(patient_key(), test_config(), acquire);

    assert!(matches!(next_rdv(&mut rig).await, RendezvousCommand::Join));
    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    wait_for_state(&mut snapshot_rx, CallState::AwaitingPeer).await;

    rig.rdv_events
        .send(RendezvousEvent::Rejected(RendezvousError::RoomFull))
        .await
        .unwrap();

    timeout(WAIT, async {
        loop {
            if snapshot_rx.borrow().state == CallState::Failed {
                break;
            }
            snapshot_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("rejection did not fail the session");
    assert!(rig.handle.snapshot().failure.unwrap().contains("full"));
}

#[tokio::test]
async fn closing_during_acquisition_still_releases_the_devices() {
    let hooks_slot: Arc<Mutex<Option<FakeMediaHooks>>> = Arc::new(Mutex::new(None));
    let slot = hooks_slot.clone();
    let acquire: MediaAcquirer = Box::new(move |_want_video| {
        // A permission prompt that takes a while to come back.
        std::thread::sleep(Duration::from_millis(300));
        let (media, hooks) = fake_media(true);
        *slot.lock().unwrap() = Some(hooks);
        Ok(media)
    });

    let rig = rig(patient_key(), test_config(), acquire);

    // Close immediately, while the acquirer is still blocked.
    rig.handle.hang_up().await;

    let mut snapshot_rx = rig.handle.snapshot_rx.clone();
    timeout(WAIT, async {
        loop {
            if snapshot_rx.borrow().state == CallState::Closed {
                break;
            }
            snapshot_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("session did not close during acquisition");

    // The late-arriving handle must still be released, within bounded time.
    timeout(WAIT, async {
        loop {
            if let Some(hooks) = hooks_slot.lock().unwrap().as_ref() {
                if hooks.probe.is_released() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("devices acquired after close were never released");
}
