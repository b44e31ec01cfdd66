pub mod call;
pub mod config;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod rendezvous;
pub mod services;
pub mod session;

use tokio::sync::{mpsc, watch};

use crate::call::engine::{run_call_engine, EngineContext};
use crate::call::{CallHandle, CallSnapshot, MediaAcquirer};
use crate::config::CallConfig;
use crate::events::create_event_bus;
use crate::negotiation::TransportFactory;
use crate::rendezvous::{client, RendezvousLink};
use crate::services::appointments::Appointment;
use crate::services::profiles::ProfileDirectory;

pub use crate::call::{CallState, CloseReason};
pub use crate::session::{PeerAddress, Role, SessionKey};

/// The collaborators one session runs against. Production sessions use
/// [`SessionDeps::live`]; scenario tests substitute scripted stand-ins that
/// speak the same channel contracts.
pub struct SessionDeps {
    pub acquire: MediaAcquirer,
    pub transport_factory: TransportFactory,
    pub rendezvous: RendezvousLink,
    pub remote_display_name: Option<String>,
}

impl SessionDeps {
    /// Real devices, real WebRTC, real relay connection.
    pub fn live(key: &SessionKey, config: &CallConfig) -> Self {
        Self {
            acquire: Box::new(media::acquire),
            transport_factory: negotiation::webrtc_factory(),
            rendezvous: client::spawn_relay_link(
                config.relay_url.clone(),
                key.appointment_id.clone(),
                key.address(),
            ),
            remote_display_name: None,
        }
    }
}

/// Start a consultation session for one participant and hand back the
/// controls the UI layer drives.
pub fn start_session(key: SessionKey, config: CallConfig) -> CallHandle {
    let deps = SessionDeps::live(&key, &config);
    start_session_with(key, config, deps)
}

/// Like [`start_session`], with every collaborator injected.
pub fn start_session_with(key: SessionKey, config: CallConfig, deps: SessionDeps) -> CallHandle {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
    let (event_tx, _event_rx) = create_event_bus();
    let (remote_frame_tx, remote_frame_rx) = mpsc::channel(16);

    let ctx = EngineContext {
        key,
        config,
        acquire: deps.acquire,
        transport_factory: deps.transport_factory,
        rendezvous: deps.rendezvous,
        command_rx,
        snapshot_tx,
        event_tx: event_tx.clone(),
        remote_frame_tx,
        remote_display_name: deps.remote_display_name,
    };
    tokio::spawn(run_call_engine(ctx));

    CallHandle {
        command_tx,
        snapshot_rx,
        event_tx,
        remote_frames: Some(remote_frame_rx),
    }
}

/// Resolve the counterpart's display name for the session snapshot.
pub fn remote_display_name(
    appointment: &Appointment,
    my_participant_id: &str,
    profiles: &dyn ProfileDirectory,
) -> Option<String> {
    let counterpart = if appointment.patient_id == my_participant_id {
        &appointment.provider_id
    } else {
        &appointment.patient_id
    };
    profiles.lookup(counterpart).map(|p| p.display_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::profiles::{InMemoryProfiles, Profile};

    #[test]
    fn counterpart_name_is_resolved_for_either_side() {
        let appointment = Appointment {
            id: "apt-3".into(),
            patient_id: "patient-5".into(),
            provider_id: "provider-9".into(),
            scheduled_at: chrono::Utc::now(),
        };
        let profiles = InMemoryProfiles::new();
        profiles.insert(Profile {
            participant_id: "patient-5".into(),
            display_name: "Alex Moreno".into(),
        });
        profiles.insert(Profile {
            participant_id: "provider-9".into(),
            display_name: "Dr. Osei".into(),
        });

        assert_eq!(
            remote_display_name(&appointment, "patient-5", &profiles).as_deref(),
            Some("Dr. Osei")
        );
        assert_eq!(
            remote_display_name(&appointment, "provider-9", &profiles).as_deref(),
            Some("Alex Moreno")
        );
    }
}
