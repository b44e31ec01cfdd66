use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{Role, SessionKey};

/// One scheduled consultation, as the portal's scheduling service exposes
/// it to this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub patient_id: String,
    pub provider_id: String,
    pub scheduled_at: DateTime<Utc>,
}

impl Appointment {
    /// The role a participant plays in this appointment, or `None` for
    /// someone who is not a party to it. The patient places the call.
    pub fn role_of(&self, participant_id: &str) -> Option<Role> {
        if participant_id == self.patient_id {
            Some(Role::Initiator)
        } else if participant_id == self.provider_id {
            Some(Role::Responder)
        } else {
            None
        }
    }

    /// Session key for a participant of this appointment.
    pub fn session_key_for(&self, participant_id: &str) -> Option<SessionKey> {
        self.role_of(participant_id)
            .map(|role| SessionKey::new(&self.id, participant_id, role))
    }
}

/// Lookup into the portal's appointment book. The real portal backs this
/// with its scheduling database; here it is an in-memory table.
pub trait AppointmentDirectory: Send + Sync {
    fn lookup(&self, appointment_id: &str) -> Option<Appointment>;
}

#[derive(Default)]
pub struct InMemoryAppointments {
    inner: RwLock<HashMap<String, Appointment>>,
}

impl InMemoryAppointments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, appointment: Appointment) {
        self.inner
            .write()
            .unwrap()
            .insert(appointment.id.clone(), appointment);
    }

    /// Seed the directory from a JSON array of appointments.
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let appointments: Vec<Appointment> = serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;

        let directory = Self::new();
        for appointment in appointments {
            directory.insert(appointment);
        }
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

impl AppointmentDirectory for InMemoryAppointments {
    fn lookup(&self, appointment_id: &str) -> Option<Appointment> {
        self.inner.read().unwrap().get(appointment_id).cloned()
    }
}
