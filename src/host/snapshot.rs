use crate::error::Result;
use crate::host::{EntityState, LiveStateSource, LiveStates, Registries};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Registries exported from the host, optionally with a frozen copy of the
/// live state store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(flatten)]
    pub registries: Registries,
    #[serde(default)]
    pub states: Vec<EntityState>,
}

impl RegistrySnapshot {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&content)?;
        info!(
            path = %path.as_ref().display(),
            declarations = snapshot.registries.device_consumption.len(),
            entities = snapshot.registries.entities.len(),
            devices = snapshot.registries.devices.len(),
            labels = snapshot.registries.labels.len(),
            "registry snapshot loaded"
        );
        Ok(snapshot)
    }

    pub fn live_states(&self) -> LiveStates {
        self.states.iter().cloned().collect()
    }
}

impl LiveStateSource for RegistrySnapshot {
    async fn fetch_states(&self) -> Result<LiveStates> {
        Ok(self.live_states())
    }
}
