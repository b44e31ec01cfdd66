use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::media::MediaHandle;
use crate::negotiation::{NegotiationMessage, SignalBody, TransportCommand};
use crate::rendezvous::RendezvousCommand;
use crate::session::PeerAddress;

/// Everything one session must give back on exit.
pub struct SessionResources {
    /// Best-effort goodbye: signaling channel, our address, current
    /// attempt, and the peer to address it to.
    pub bye: Option<(
        mpsc::Sender<RendezvousCommand>,
        PeerAddress,
        u64,
        PeerAddress,
    )>,
    pub media: Option<MediaHandle>,
    pub transport: Option<mpsc::Sender<TransportCommand>>,
    pub rendezvous: Option<mpsc::Sender<RendezvousCommand>>,
}

/// Runs the exit sequence exactly once, however many callers race to it.
///
/// The steps are independently guarded: a goodbye that cannot be delivered
/// never stops the media release, transport close, or room departure that
/// follow it.
#[derive(Clone)]
pub struct Teardown {
    inner: Arc<Mutex<Option<SessionResources>>>,
}

impl Teardown {
    pub fn new(resources: SessionResources) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(resources))),
        }
    }

    /// Returns true if this call performed the teardown; false when it
    /// already happened.
    pub async fn run(&self) -> bool {
        let Some(mut resources) = self.inner.lock().await.take() else {
            debug!("teardown already ran");
            return false;
        };

        // (a) goodbye, best effort with no retry
        if let Some((signaling, from, attempt, to)) = resources.bye.take() {
            let message = NegotiationMessage {
                from,
                attempt,
                body: SignalBody::Bye,
            };
            if signaling
                .try_send(RendezvousCommand::Signal { to, message })
                .is_err()
            {
                debug!("goodbye not delivered, signaling unavailable");
            }
        }

        // (b) release capture devices
        if let Some(mut media) = resources.media.take() {
            media.release();
        }

        // (c) close the negotiation transport
        if let Some(transport) = resources.transport.take() {
            let _ = transport.try_send(TransportCommand::Close);
        }

        // (d) leave the room
        if let Some(rendezvous) = resources.rendezvous.take() {
            let _ = rendezvous.try_send(RendezvousCommand::Leave);
        }

        info!("session resources released");
        true
    }
}
