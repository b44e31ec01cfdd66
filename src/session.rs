use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace UUID for deterministic peer address derivation.
/// Changing this value changes every derived address, so it is fixed forever.
const ADDRESS_NAMESPACE: Uuid = Uuid::from_u128(0x7d1c_29a4_5e0b_4f83_9c6a_fd20_41b7_8e55);

/// Which side of the consultation this participant is.
/// The patient always initiates the offer; the provider answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Identity of one participant in one scheduled consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub appointment_id: String,
    pub participant_id: String,
    pub role: Role,
}

impl SessionKey {
    pub fn new(appointment_id: impl Into<String>, participant_id: impl Into<String>, role: Role) -> Self {
        Self {
            appointment_id: appointment_id.into(),
            participant_id: participant_id.into(),
            role,
        }
    }

    /// Derive the stable rendezvous address for this key.
    ///
    /// The derivation is a pure function of the key, so a participant that
    /// reconnects after a network blip presents the same address and is
    /// treated as the same logical party rather than a third joiner.
    pub fn address(&self) -> PeerAddress {
        let material = format!("{}:{}:{}", self.appointment_id, self.participant_id, self.role);
        PeerAddress(Uuid::new_v5(&ADDRESS_NAMESPACE, material.as_bytes()))
    }
}

/// Deterministic identifier a participant registers under in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(pub Uuid);

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_derivation_is_deterministic() {
        let key = SessionKey::new("apt-100", "patient-7", Role::Initiator);
        assert_eq!(key.address(), key.address());
        assert_eq!(key.address(), key.clone().address());
    }

    #[test]
    fn address_changes_with_any_component() {
        let base = SessionKey::new("apt-100", "patient-7", Role::Initiator);
        let other_appointment = SessionKey::new("apt-101", "patient-7", Role::Initiator);
        let other_participant = SessionKey::new("apt-100", "patient-8", Role::Initiator);
        let other_role = SessionKey::new("apt-100", "patient-7", Role::Responder);

        assert_ne!(base.address(), other_appointment.address());
        assert_ne!(base.address(), other_participant.address());
        assert_ne!(base.address(), other_role.address());
    }
}
