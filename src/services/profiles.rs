use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Display information for a portal user, resolved for the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub participant_id: String,
    pub display_name: String,
}

/// Lookup into the portal's user profile service.
pub trait ProfileDirectory: Send + Sync {
    fn lookup(&self, participant_id: &str) -> Option<Profile>;
}

#[derive(Default)]
pub struct InMemoryProfiles {
    inner: RwLock<HashMap<String, Profile>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: Profile) {
        self.inner
            .write()
            .unwrap()
            .insert(profile.participant_id.clone(), profile);
    }
}

impl ProfileDirectory for InMemoryProfiles {
    fn lookup(&self, participant_id: &str) -> Option<Profile> {
        self.inner.read().unwrap().get(participant_id).cloned()
    }
}
