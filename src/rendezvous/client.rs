use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::session::PeerAddress;

use super::{
    ClientFrame, ErrorKind, RendezvousCommand, RendezvousError, RendezvousEvent, RendezvousLink,
    ServerFrame,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Spawn the relay link actor for one participant. The actor stays idle
/// until the engine commands `Join`, then keeps the relay connection alive
/// (with a single bounded reconnect) until `Leave` or failure.
pub fn spawn_relay_link(
    relay_url: String,
    appointment_id: String,
    peer: PeerAddress,
) -> RendezvousLink {
    let (command_tx, command_rx) = mpsc::channel::<RendezvousCommand>(64);
    let (event_tx, event_rx) = mpsc::channel::<RendezvousEvent>(64);

    tokio::spawn(run_link(relay_url, appointment_id, peer, command_rx, event_tx));

    RendezvousLink {
        command_tx,
        event_rx,
    }
}

async fn run_link(
    relay_url: String,
    appointment_id: String,
    peer: PeerAddress,
    mut command_rx: mpsc::Receiver<RendezvousCommand>,
    event_tx: mpsc::Sender<RendezvousEvent>,
) {
    // Media comes first; nothing happens here until the engine says join.
    loop {
        match command_rx.recv().await {
            Some(RendezvousCommand::Join) => break,
            Some(other) => debug!("relay command before join ignored: {:?}", other),
            None => return,
        }
    }

    let (mut sink, mut source) = match connect_and_join(&relay_url, &appointment_id, peer).await {
        Ok(halves) => halves,
        Err(e) => {
            let _ = event_tx.send(RendezvousEvent::Lost(e)).await;
            return;
        }
    };
    info!(appointment_id = %appointment_id, %peer, "joined rendezvous relay");

    // One reconnect, ever. Room state is relay memory only, so a rejoin
    // with the same address restores membership without a duplicate
    // announcement.
    let mut reconnected = false;

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(RendezvousCommand::Join) => {
                        // Engine-requested re-registration; idempotent on
                        // the relay side.
                        if send_frame(&mut sink, &join_frame(&appointment_id, peer)).await.is_err() {
                            match try_reconnect(&relay_url, &appointment_id, peer, &mut reconnected).await {
                                Some(halves) => (sink, source) = halves,
                                None => {
                                    let _ = event_tx.send(lost("relay send failed")).await;
                                    break;
                                }
                            }
                        }
                    }
                    Some(RendezvousCommand::Leave) => {
                        let frame = ClientFrame::Leave {
                            appointment_id: appointment_id.clone(),
                            peer,
                        };
                        let _ = send_frame(&mut sink, &frame).await;
                        let _ = sink.send(Message::Close(None)).await;
                        debug!("left rendezvous relay");
                        break;
                    }
                    Some(RendezvousCommand::Signal { to, message }) => {
                        let frame = ClientFrame::Signal { to, message };
                        if send_frame(&mut sink, &frame).await.is_err() {
                            match try_reconnect(&relay_url, &appointment_id, peer, &mut reconnected).await {
                                Some(halves) => {
                                    (sink, source) = halves;
                                    // The signal itself is not replayed; the
                                    // negotiation layer owns retry semantics.
                                    debug!("relay reconnected, dropped one outbound signal");
                                }
                                None => {
                                    let _ = event_tx.send(lost("relay send failed")).await;
                                    break;
                                }
                            }
                        }
                    }
                    None => break,
                }
            }

            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if dispatch(frame, &event_tx).await.is_break() {
                                    break;
                                }
                            }
                            Err(e) => debug!("undecodable relay frame dropped: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => {
                        match try_reconnect(&relay_url, &appointment_id, peer, &mut reconnected).await {
                            Some(halves) => (sink, source) = halves,
                            None => {
                                let _ = event_tx.send(lost("relay connection closed")).await;
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Translate one relay frame into engine events. Breaks the link on
/// terminal rejections.
async fn dispatch(
    frame: ServerFrame,
    event_tx: &mpsc::Sender<RendezvousEvent>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    match frame {
        ServerFrame::Joined { peers } => {
            let _ = event_tx.send(RendezvousEvent::Joined { peers }).await;
            ControlFlow::Continue(())
        }
        ServerFrame::PeerJoined { peer } => {
            let _ = event_tx.send(RendezvousEvent::PeerJoined { peer }).await;
            ControlFlow::Continue(())
        }
        ServerFrame::PeerLeft { peer } => {
            let _ = event_tx.send(RendezvousEvent::PeerLeft { peer }).await;
            ControlFlow::Continue(())
        }
        ServerFrame::Signal { message } => {
            let _ = event_tx.send(RendezvousEvent::Signal(message)).await;
            ControlFlow::Continue(())
        }
        ServerFrame::Error { kind, message } => {
            warn!("relay refused us: {}", message);
            let error = match kind {
                ErrorKind::RoomFull => RendezvousError::RoomFull,
                ErrorKind::NotAuthorized => RendezvousError::NotAuthorized(message),
                ErrorKind::BadRequest => RendezvousError::Protocol(message),
            };
            let _ = event_tx.send(RendezvousEvent::Rejected(error)).await;
            ControlFlow::Break(())
        }
    }
}

async fn connect_and_join(
    relay_url: &str,
    appointment_id: &str,
    peer: PeerAddress,
) -> Result<(WsSink, WsSource), RendezvousError> {
    let url = Url::parse(relay_url)
        .map_err(|e| RendezvousError::Protocol(format!("bad relay url: {}", e)))?;

    let (socket, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| RendezvousError::TransportLost(e.to_string()))?;

    let (mut sink, source) = socket.split();
    send_frame(&mut sink, &join_frame(appointment_id, peer))
        .await
        .map_err(RendezvousError::TransportLost)?;

    Ok((sink, source))
}

/// The single bounded reconnect: short jittered pause, fresh connection,
/// re-join under the same address. `None` once the attempt is spent.
async fn try_reconnect(
    relay_url: &str,
    appointment_id: &str,
    peer: PeerAddress,
    reconnected: &mut bool,
) -> Option<(WsSink, WsSource)> {
    if *reconnected {
        return None;
    }
    *reconnected = true;

    let pause = rand::thread_rng().gen_range(250..750);
    tokio::time::sleep(std::time::Duration::from_millis(pause)).await;

    match connect_and_join(relay_url, appointment_id, peer).await {
        Ok(halves) => {
            info!("rendezvous relay reconnected");
            Some(halves)
        }
        Err(e) => {
            warn!("rendezvous reconnect failed: {}", e);
            None
        }
    }
}

fn join_frame(appointment_id: &str, peer: PeerAddress) -> ClientFrame {
    ClientFrame::Join {
        appointment_id: appointment_id.to_string(),
        peer,
    }
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), String> {
    let json = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}

fn lost(detail: &str) -> RendezvousEvent {
    RendezvousEvent::Lost(RendezvousError::TransportLost(detail.to_string()))
}
