use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::services::appointments::AppointmentDirectory;
use crate::session::{PeerAddress, Role, SessionKey};

use super::registry::RoomRegistry;
use super::{ClientFrame, ErrorKind, ServerFrame};

/// Frames above this size are protocol abuse, not signaling.
const MAX_FRAME_BYTES: usize = 64 * 1024;
/// Outbound frames queued per connection before the relay drops them.
const OUTBOX_CAPACITY: usize = 128;

/// Shared state behind every relay connection.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<RoomRegistry>,
    /// When present, joins are checked against the appointment book; when
    /// absent the relay trusts any well-formed address (dev mode).
    pub appointments: Option<Arc<dyn AppointmentDirectory>>,
}

impl RelayState {
    pub fn new(appointments: Option<Arc<dyn AppointmentDirectory>>) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            appointments,
        }
    }
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve the relay until the process exits.
pub async fn start_relay(state: RelayState, port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind relay listener");
    serve_relay(listener, state).await;
}

/// Serve the relay on an already-bound listener.
pub async fn serve_relay(listener: tokio::net::TcpListener, state: RelayState) {
    if let Ok(addr) = listener.local_addr() {
        info!("rendezvous relay listening on ws://{}/ws", addr);
    }
    axum::serve(listener, build_router(state))
        .await
        .expect("relay server error");
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: RelayState) {
    debug!("relay client connected");

    // Writer side is decoupled through an outbox so the registry can queue
    // frames without holding the socket.
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerFrame>(OUTBOX_CAPACITY);

    // Which room this connection is registered in, once it has joined.
    let mut membership: Option<(String, PeerAddress)> = None;

    loop {
        tokio::select! {
            frame = outbox_rx.recv() => {
                // The registry dropped our seat (replaced registration) when
                // the channel is closed.
                let Some(frame) = frame else { break };
                // The only error the registry queues is the replaced-by-
                // reconnect notice; the new connection now owns the seat, so
                // this one must exit without deregistering it.
                let replaced = matches!(frame, ServerFrame::Error { .. });
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("failed to serialize relay frame: {}", e),
                }
                if replaced {
                    membership = None;
                    break;
                }
            }

            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };

                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("invalid relay frame: {}", e);
                        send_error(&mut socket, ErrorKind::BadRequest, "invalid frame").await;
                        continue;
                    }
                };

                match frame {
                    ClientFrame::Join { appointment_id, peer } => {
                        if let Err((kind, message)) = authorize(&state, &appointment_id, peer) {
                            warn!(appointment_id = %appointment_id, %peer, "join refused: {}", message);
                            send_error(&mut socket, kind, &message).await;
                            continue;
                        }

                        match state
                            .registry
                            .join(&appointment_id, peer, outbox_tx.clone())
                            .await
                        {
                            Ok(peers) => {
                                membership = Some((appointment_id, peer));
                                let reply = ServerFrame::Joined { peers };
                                if let Ok(json) = serde_json::to_string(&reply) {
                                    if socket.send(Message::Text(json)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                send_error(&mut socket, ErrorKind::RoomFull, &e.to_string()).await;
                            }
                        }
                    }

                    ClientFrame::Leave { appointment_id, peer } => {
                        state.registry.leave(&appointment_id, peer).await;
                        if membership.as_ref().map(|(_, addr)| *addr) == Some(peer) {
                            membership = None;
                        }
                    }

                    ClientFrame::Signal { to, message } => {
                        let Some((appointment_id, _)) = membership.as_ref() else {
                            send_error(&mut socket, ErrorKind::BadRequest, "join before signaling")
                                .await;
                            continue;
                        };
                        let delivered = state
                            .registry
                            .deliver(appointment_id, to, ServerFrame::Signal { message })
                            .await;
                        if !delivered {
                            debug!(%to, "signal target not registered");
                        }
                    }
                }
            }
        }
    }

    // Implicit departure on disconnect.
    if let Some((appointment_id, peer)) = membership {
        state.registry.leave(&appointment_id, peer).await;
    }
    debug!("relay client disconnected");
}

/// A join is valid when its address matches one of the two addresses the
/// appointment's parties would derive: the patient initiates, the provider
/// responds. Anything else is either a stranger or a role mismatch.
fn authorize(
    state: &RelayState,
    appointment_id: &str,
    peer: PeerAddress,
) -> Result<(), (ErrorKind, String)> {
    let Some(directory) = state.appointments.as_ref() else {
        return Ok(());
    };

    let Some(appointment) = directory.lookup(appointment_id) else {
        return Err((ErrorKind::NotAuthorized, "unknown appointment".into()));
    };

    let patient = SessionKey::new(appointment_id, &appointment.patient_id, Role::Initiator);
    let provider = SessionKey::new(appointment_id, &appointment.provider_id, Role::Responder);
    if peer == patient.address() || peer == provider.address() {
        Ok(())
    } else {
        Err((
            ErrorKind::NotAuthorized,
            "address does not belong to this appointment".into(),
        ))
    }
}

async fn send_error(socket: &mut WebSocket, kind: ErrorKind, message: &str) {
    let frame = ServerFrame::Error {
        kind,
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json)).await;
    }
}
