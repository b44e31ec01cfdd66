use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
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

use crate::media::codec::{OpusDecoder, OpusEncoder, SAMPLE_RATE};
use crate::session::Role;

use super::{NegotiationError, TransportCommand, TransportEvent, TransportLink, TransportSeed};

/// Label of the data channel carrying video frames and status.
const MEDIA_CHANNEL: &str = "consult-media";

/// Max data channel message size (under the 16KB SCTP limit).
const MAX_DC_MSG_SIZE: usize = 15_000;
/// Chunk header: 'C' + frame_id(4) + total_chunks(2) + chunk_index(2).
const CHUNK_HEADER_SIZE: usize = 9;
const MAX_CHUNK_DATA: usize = MAX_DC_MSG_SIZE - CHUNK_HEADER_SIZE;

/// Frame tags on the media channel.
const TAG_VIDEO: u8 = b'V';
const TAG_CHUNK: u8 = b'C';
const TAG_VIDEO_STATUS: u8 = b'T';

/// Spawn the production WebRTC transport actor for one negotiation attempt.
pub fn spawn_webrtc_transport(seed: TransportSeed) -> TransportLink {
    let (command_tx, command_rx) = mpsc::channel::<TransportCommand>(256);
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);

    tokio::spawn(async move {
        if let Err(e) = run_transport(seed, command_rx, event_tx.clone()).await {
            let _ = event_tx.send(TransportEvent::Failed(e)).await;
        }
    });

    TransportLink {
        command_tx,
        event_rx,
    }
}

/// Reassembles video frames that were split across data channel messages.
#[derive(Default)]
struct ChunkAssembler {
    /// frame_id -> (total_chunks, received chunks by index)
    pending: HashMap<u32, (u16, HashMap<u16, Vec<u8>>)>,
}

impl ChunkAssembler {
    fn add_chunk(
        &mut self,
        frame_id: u32,
        total_chunks: u16,
        chunk_index: u16,
        data: Vec<u8>,
    ) -> Option<Vec<u8>> {
        let entry = self
            .pending
            .entry(frame_id)
            .or_insert_with(|| (total_chunks, HashMap::new()));
        entry.1.insert(chunk_index, data);

        if entry.1.len() == total_chunks as usize {
            let (_, chunks) = self.pending.remove(&frame_id)?;
            let mut frame = Vec::new();
            for i in 0..total_chunks {
                frame.extend_from_slice(chunks.get(&i)?);
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Drop partial frames that fell too far behind the current one.
    fn discard_stale(&mut self, current_frame_id: u32) {
        self.pending
            .retain(|id, _| current_frame_id.wrapping_sub(*id) < 4);
    }
}

struct Transport {
    pc: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticSample>,
    media_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    video_active: Arc<AtomicBool>,
    encoder: Option<OpusEncoder>,
    frame_counter: u32,
}

async fn run_transport(
    seed: TransportSeed,
    mut command_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
) -> Result<(), NegotiationError> {
    let mut transport = build_transport(&seed, &event_tx).await?;
    info!(role = %seed.role, attempt = seed.attempt, "negotiation transport ready");

    while let Some(command) = command_rx.recv().await {
        match command {
            TransportCommand::MakeOffer => {
                if seed.role != Role::Initiator {
                    warn!("offer requested on a responder transport, ignoring");
                    continue;
                }
                // The offerer opens the media channel; it rides the single
                // offer/answer exchange.
                let dc = transport
                    .pc
                    .create_data_channel(MEDIA_CHANNEL, None)
                    .await
                    .map_err(internal)?;
                attach_media_channel(&transport, &event_tx, dc).await;

                let offer = transport.pc.create_offer(None).await.map_err(internal)?;
                transport
                    .pc
                    .set_local_description(offer.clone())
                    .await
                    .map_err(internal)?;
                let sdp = serde_json::to_string(&offer).map_err(internal)?;
                let _ = event_tx.send(TransportEvent::OfferReady { sdp }).await;
            }

            TransportCommand::AcceptOffer { sdp } => {
                let offer: RTCSessionDescription = serde_json::from_str(&sdp).map_err(internal)?;
                transport
                    .pc
                    .set_remote_description(offer)
                    .await
                    .map_err(internal)?;
                let answer = transport.pc.create_answer(None).await.map_err(internal)?;
                transport
                    .pc
                    .set_local_description(answer.clone())
                    .await
                    .map_err(internal)?;
                let sdp = serde_json::to_string(&answer).map_err(internal)?;
                let _ = event_tx.send(TransportEvent::AnswerReady { sdp }).await;
            }

            TransportCommand::ApplyAnswer { sdp } => {
                let answer: RTCSessionDescription =
                    serde_json::from_str(&sdp).map_err(internal)?;
                transport
                    .pc
                    .set_remote_description(answer)
                    .await
                    .map_err(internal)?;
            }

            TransportCommand::AddCandidate { candidate } => {
                let init: RTCIceCandidateInit = match serde_json::from_str(&candidate) {
                    Ok(init) => init,
                    Err(e) => {
                        debug!("malformed candidate dropped: {}", e);
                        continue;
                    }
                };
                if let Err(e) = transport.pc.add_ice_candidate(init).await {
                    debug!("failed to add candidate: {}", e);
                }
            }

            TransportCommand::AudioFrame(pcm) => {
                let Some(encoder) = transport.encoder.as_mut() else {
                    continue;
                };
                match encoder.encode(&pcm) {
                    Ok(opus_data) => {
                        let sample = Sample {
                            data: opus_data.into(),
                            duration: Duration::from_millis(20),
                            ..Default::default()
                        };
                        if let Err(e) = transport.audio_track.write_sample(&sample).await {
                            debug!("failed to write audio sample: {}", e);
                        }
                    }
                    Err(e) => debug!("opus encode failed: {}", e),
                }
            }

            TransportCommand::VideoFrame(jpeg) => {
                send_video_frame(&mut transport, &jpeg).await;
            }

            TransportCommand::SetVideoActive(active) => {
                transport.video_active.store(active, Ordering::Relaxed);
                send_video_status(&transport, active).await;
            }

            TransportCommand::Close => {
                let _ = event_tx.send(TransportEvent::Closed).await;
                break;
            }
        }
    }

    // Reached on Close and when the session drops the command channel;
    // either way the peer connection must not outlive the actor.
    if let Err(e) = transport.pc.close().await {
        debug!("error closing peer connection: {}", e);
    }

    Ok(())
}

async fn build_transport(
    seed: &TransportSeed,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> Result<Transport, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(internal)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(internal)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: seed.stun_servers.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let pc = Arc::new(api.new_peer_connection(config).await.map_err(internal)?);

    // Outgoing voice track.
    let audio_track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: SAMPLE_RATE,
            channels: 1,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        "audio".to_string(),
        "televisit".to_string(),
    ));
    let rtp_sender = pc
        .add_track(audio_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(internal)?;

    // Drain RTCP so the sender keeps flowing.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while rtp_sender.read(&mut buf).await.is_ok() {}
    });

    let transport = Transport {
        pc: pc.clone(),
        audio_track,
        media_channel: Arc::new(Mutex::new(None)),
        video_active: Arc::new(AtomicBool::new(false)),
        encoder: OpusEncoder::new()
            .map_err(|e| warn!("voice encoder unavailable: {}", e))
            .ok(),
        frame_counter: 0,
    };

    // Connection state changes drive the call state machine.
    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            info!("peer connection state: {}", state);
            let event = match state {
                RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportEvent::Disconnected),
                RTCPeerConnectionState::Failed => {
                    Some(TransportEvent::Failed(NegotiationError::NoViablePath))
                }
                RTCPeerConnectionState::Closed => Some(TransportEvent::Closed),
                _ => None,
            };
            if let Some(event) = event {
                let _ = tx.send(event).await;
            }
        })
    }));

    // Locally gathered candidates go out through signaling.
    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        if let Ok(json) = serde_json::to_string(&init) {
                            let _ = tx
                                .send(TransportEvent::CandidateReady { candidate: json })
                                .await;
                        }
                    }
                    Err(e) => warn!("failed to serialize candidate: {}", e),
                }
            }
        })
    }));

    // Remote voice track: decode and hand to playback.
    let playback_tx = seed.playback_tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let playback_tx = playback_tx.clone();
        Box::pin(async move {
            if track.kind() != RTPCodecType::Audio {
                return;
            }
            info!("remote audio track started");
            tokio::spawn(async move {
                let mut decoder = match OpusDecoder::new() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("voice decoder unavailable: {}", e);
                        return;
                    }
                };
                loop {
                    match track.read_rtp().await {
                        Ok((packet, _)) => {
                            if packet.payload.is_empty() {
                                continue;
                            }
                            match decoder.decode(&packet.payload) {
                                Ok(pcm) => {
                                    if let Some(ref playback) = playback_tx {
                                        let _ = playback.try_send(pcm);
                                    }
                                }
                                Err(e) => debug!("opus decode failed: {}", e),
                            }
                        }
                        Err(e) => {
                            debug!("remote audio track ended: {}", e);
                            break;
                        }
                    }
                }
            });
        })
    }));

    // Responder side: the offerer's media channel arrives here.
    let tx = event_tx.clone();
    let channel_slot = transport.media_channel.clone();
    let video_active = transport.video_active.clone();
    pc.on_data_channel(Box::new(move |dc| {
        let tx = tx.clone();
        let channel_slot = channel_slot.clone();
        let video_active = video_active.clone();
        Box::pin(async move {
            if dc.label() != MEDIA_CHANNEL {
                debug!("ignoring unexpected data channel '{}'", dc.label());
                return;
            }
            setup_media_channel(&tx, &channel_slot, &video_active, dc).await;
        })
    }));

    Ok(transport)
}

/// Wire up a media channel created locally (offerer side).
async fn attach_media_channel(
    transport: &Transport,
    event_tx: &mpsc::Sender<TransportEvent>,
    dc: Arc<RTCDataChannel>,
) {
    setup_media_channel(
        event_tx,
        &transport.media_channel,
        &transport.video_active,
        dc,
    )
    .await;
}

/// Store the channel for sending and install its message handlers.
async fn setup_media_channel(
    event_tx: &mpsc::Sender<TransportEvent>,
    channel_slot: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    video_active: &Arc<AtomicBool>,
    dc: Arc<RTCDataChannel>,
) {
    channel_slot.lock().await.insert(dc.clone());

    // Announce our current video state as soon as the channel opens so the
    // peer does not have to guess.
    let dc_open = dc.clone();
    let video_active = video_active.clone();
    dc.on_open(Box::new(move || {
        let dc = dc_open.clone();
        let active = video_active.load(Ordering::Relaxed);
        Box::pin(async move {
            let frame = bytes::Bytes::from(vec![TAG_VIDEO_STATUS, active as u8]);
            if let Err(e) = dc.send(&frame).await {
                debug!("failed to send initial video status: {}", e);
            }
        })
    }));

    let tx = event_tx.clone();
    let assembler = Arc::new(Mutex::new(ChunkAssembler::default()));
    dc.on_message(Box::new(move |msg| {
        let tx = tx.clone();
        let assembler = assembler.clone();
        Box::pin(async move {
            let data = msg.data.to_vec();
            if data.is_empty() {
                return;
            }
            match data[0] {
                TAG_VIDEO => {
                    let _ = tx
                        .send(TransportEvent::RemoteVideoFrame {
                            jpeg: data[1..].to_vec(),
                        })
                        .await;
                }
                TAG_VIDEO_STATUS => {
                    if data.len() >= 2 {
                        let _ = tx
                            .send(TransportEvent::RemoteVideo {
                                active: data[1] != 0,
                            })
                            .await;
                    }
                }
                TAG_CHUNK => {
                    if data.len() < CHUNK_HEADER_SIZE {
                        return;
                    }
                    let frame_id = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                    let total_chunks = u16::from_le_bytes([data[5], data[6]]);
                    let chunk_index = u16::from_le_bytes([data[7], data[8]]);

                    let mut assembler = assembler.lock().await;
                    assembler.discard_stale(frame_id);
                    if let Some(frame) = assembler.add_chunk(
                        frame_id,
                        total_chunks,
                        chunk_index,
                        data[CHUNK_HEADER_SIZE..].to_vec(),
                    ) {
                        let _ = tx.send(TransportEvent::RemoteVideoFrame { jpeg: frame }).await;
                    }
                }
                other => debug!("unknown media channel tag: {}", other),
            }
        })
    }));
}

/// Send one JPEG frame, chunking when it exceeds a single message.
async fn send_video_frame(transport: &mut Transport, jpeg: &[u8]) {
    let Some(dc) = transport.media_channel.lock().await.clone() else {
        return;
    };

    if 1 + jpeg.len() <= MAX_DC_MSG_SIZE {
        let mut msg = Vec::with_capacity(1 + jpeg.len());
        msg.push(TAG_VIDEO);
        msg.extend_from_slice(jpeg);
        if let Err(e) = dc.send(&bytes::Bytes::from(msg)).await {
            debug!("failed to send video frame: {}", e);
        }
        return;
    }

    let frame_id = transport.frame_counter;
    transport.frame_counter = transport.frame_counter.wrapping_add(1);
    let total_chunks = jpeg.len().div_ceil(MAX_CHUNK_DATA) as u16;

    for chunk_index in 0..total_chunks {
        let start = chunk_index as usize * MAX_CHUNK_DATA;
        let end = std::cmp::min(start + MAX_CHUNK_DATA, jpeg.len());

        let mut msg = Vec::with_capacity(CHUNK_HEADER_SIZE + (end - start));
        msg.push(TAG_CHUNK);
        msg.extend_from_slice(&frame_id.to_le_bytes());
        msg.extend_from_slice(&total_chunks.to_le_bytes());
        msg.extend_from_slice(&chunk_index.to_le_bytes());
        msg.extend_from_slice(&jpeg[start..end]);

        if let Err(e) = dc.send(&bytes::Bytes::from(msg)).await {
            debug!(
                "failed to send video chunk {}/{}: {}",
                chunk_index + 1,
                total_chunks,
                e
            );
            break;
        }
    }
}

async fn send_video_status(transport: &Transport, active: bool) {
    let Some(dc) = transport.media_channel.lock().await.clone() else {
        return;
    };
    let frame = bytes::Bytes::from(vec![TAG_VIDEO_STATUS, active as u8]);
    if let Err(e) = dc.send(&frame).await {
        debug!("failed to send video status: {}", e);
    }
}

fn internal(err: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Internal(err.to_string())
}
