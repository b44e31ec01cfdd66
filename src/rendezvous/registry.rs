use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::session::PeerAddress;

use super::{RendezvousError, ServerFrame};

/// At most the two consultation parties may register in a room.
const ROOM_CAPACITY: usize = 2;

/// One registered member: the outbox of its relay connection.
pub struct Seat {
    pub outbox: mpsc::Sender<ServerFrame>,
}

#[derive(Default)]
struct Room {
    members: HashMap<PeerAddress, Seat>,
}

/// In-memory room state, shared by every relay connection.
///
/// The outer map is only touched to find or create a room; all membership
/// mutation happens under the room's own lock, so appointments never
/// contend with each other.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` in the appointment's room.
    ///
    /// Re-joining with an already-registered address replaces the previous
    /// registration (the old connection is told and dropped) and is not
    /// announced to other members. A third distinct address is refused.
    /// Returns the members that were already present.
    pub async fn join(
        &self,
        appointment_id: &str,
        peer: PeerAddress,
        outbox: mpsc::Sender<ServerFrame>,
    ) -> Result<Vec<PeerAddress>, RendezvousError> {
        let room = self.room_for(appointment_id).await;
        let mut room = room.lock().await;

        let replacing = room.members.contains_key(&peer);
        if !replacing && room.members.len() >= ROOM_CAPACITY {
            warn!(appointment_id, %peer, "join refused, room full");
            return Err(RendezvousError::RoomFull);
        }

        let existing: Vec<PeerAddress> = room
            .members
            .keys()
            .filter(|addr| **addr != peer)
            .copied()
            .collect();

        if let Some(previous) = room.members.insert(peer, Seat { outbox }) {
            debug!(appointment_id, %peer, "registration replaced by reconnect");
            let _ = previous.outbox.try_send(ServerFrame::Error {
                kind: super::ErrorKind::BadRequest,
                message: "registration replaced by a newer connection".into(),
            });
        } else {
            info!(appointment_id, %peer, "peer joined room");
            broadcast(&room, peer, ServerFrame::PeerJoined { peer });
        }

        Ok(existing)
    }

    /// Remove `peer` from the room, announce the departure, and destroy the
    /// room once it is empty. Quiet no-op if the peer was not registered.
    pub async fn leave(&self, appointment_id: &str, peer: PeerAddress) {
        let Some(room) = self.existing_room(appointment_id).await else {
            return;
        };

        let empty = {
            let mut room = room.lock().await;
            if room.members.remove(&peer).is_some() {
                info!(appointment_id, %peer, "peer left room");
                broadcast(&room, peer, ServerFrame::PeerLeft { peer });
            }
            room.members.is_empty()
        };

        if empty {
            let mut rooms = self.rooms.write().await;
            // Re-check under the write lock; someone may have joined since.
            if let Some(entry) = rooms.get(appointment_id) {
                if entry.lock().await.members.is_empty() {
                    rooms.remove(appointment_id);
                    debug!(appointment_id, "room destroyed");
                }
            }
        }
    }

    /// Forward a frame to one member of the room. Returns whether the
    /// target was registered.
    pub async fn deliver(&self, appointment_id: &str, to: PeerAddress, frame: ServerFrame) -> bool {
        let Some(room) = self.existing_room(appointment_id).await else {
            return false;
        };
        let room = room.lock().await;
        match room.members.get(&to) {
            Some(seat) => {
                if seat.outbox.try_send(frame).is_err() {
                    warn!(appointment_id, %to, "member outbox full, frame dropped");
                }
                true
            }
            None => false,
        }
    }

    /// Current number of registered members (diagnostics).
    pub async fn room_size(&self, appointment_id: &str) -> usize {
        match self.existing_room(appointment_id).await {
            Some(room) => room.lock().await.members.len(),
            None => 0,
        }
    }

    async fn room_for(&self, appointment_id: &str) -> Arc<Mutex<Room>> {
        if let Some(room) = self.existing_room(appointment_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(appointment_id.to_string())
            .or_default()
            .clone()
    }

    async fn existing_room(&self, appointment_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(appointment_id).cloned()
    }
}

fn broadcast(room: &Room, about: PeerAddress, frame: ServerFrame) {
    for (addr, seat) in &room.members {
        if *addr == about {
            continue;
        }
        if seat.outbox.try_send(frame.clone()).is_err() {
            warn!(%addr, "member outbox full, room event dropped");
        }
    }
}
