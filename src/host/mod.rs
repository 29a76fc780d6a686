//! Read-only view of the host platform: consumption declarations, the entity,
//! device and label registries, the live state store and the history query.

pub mod rest;
pub mod snapshot;

use crate::error::Result;
use crate::units;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;

pub use rest::RestClient;
pub use snapshot::RegistrySnapshot;

/// One entry of the host's energy `device_consumption` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionDeclaration {
    #[serde(rename = "stat_consumption")]
    pub stat_id: String,
    #[serde(rename = "included_in_stat", default)]
    pub included_in: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRegistryEntry {
    pub entity_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistryEntry {
    #[serde(rename = "id")]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRegistryEntry {
    pub label_id: String,
    pub name: String,
}

/// Everything the tree builder needs from the host registries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registries {
    #[serde(default)]
    pub device_consumption: Vec<ConsumptionDeclaration>,
    #[serde(default)]
    pub entities: Vec<EntityRegistryEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceRegistryEntry>,
    #[serde(default)]
    pub labels: Vec<LabelRegistryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateAttributes {
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: StateAttributes,
}

impl EntityState {
    /// Instantaneous power in watts; absent or non-numeric states are `None`.
    pub fn power_watts(&self) -> Option<f64> {
        let raw = parse_state(&self.state)?;
        Some(units::to_watts(
            raw,
            self.attributes.unit_of_measurement.as_deref(),
        ))
    }

    pub fn is_power(&self) -> bool {
        self.attributes.device_class.as_deref() == Some("power")
    }
}

/// Parse a host state string; `unavailable`, `unknown` and garbage yield `None`.
pub fn parse_state(state: &str) -> Option<f64> {
    state
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Snapshot of the live state store keyed by entity id.
#[derive(Debug, Clone, Default)]
pub struct LiveStates {
    states: HashMap<String, EntityState>,
}

impl LiveStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: EntityState) {
        self.states.insert(state.entity_id.clone(), state);
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityState> {
        self.states.get(entity_id)
    }

    /// Power reading in watts, 0 when missing or unparseable.
    pub fn power(&self, entity_id: &str) -> f64 {
        self.get(entity_id)
            .and_then(EntityState::power_watts)
            .unwrap_or(0.0)
    }

    pub fn unit(&self, entity_id: &str) -> Option<&str> {
        self.get(entity_id)
            .and_then(|s| s.attributes.unit_of_measurement.as_deref())
    }

    /// Every sensor that declares a unit of measurement.
    pub fn units(&self) -> SensorUnits {
        self.states
            .values()
            .filter_map(|s| {
                let unit = s.attributes.unit_of_measurement.as_ref()?;
                Some((s.entity_id.clone(), unit.clone()))
            })
            .collect()
    }

    pub fn friendly_name(&self, entity_id: &str) -> Option<&str> {
        self.get(entity_id)
            .and_then(|s| s.attributes.friendly_name.as_deref())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl FromIterator<EntityState> for LiveStates {
    fn from_iter<T: IntoIterator<Item = EntityState>>(iter: T) -> Self {
        let mut states = LiveStates::new();
        for state in iter {
            states.insert(state);
        }
        states
    }
}

/// A single historical state change, oldest-first within a series.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySample {
    pub state: String,
    pub last_updated: f64,
}

impl HistorySample {
    pub fn new(state: impl Into<String>, last_updated: f64) -> Self {
        Self {
            state: state.into(),
            last_updated,
        }
    }

    pub fn value(&self) -> Option<f64> {
        parse_state(&self.state)
    }
}

/// Historical samples per entity id.
pub type HistoryBatch = HashMap<String, Vec<HistorySample>>;

/// Unit of measurement per sensor id. History is queried without attributes,
/// so backfilled values are scaled with the units last seen live.
pub type SensorUnits = HashMap<String, String>;

/// Pull access to the live state store.
pub trait LiveStateSource: Send + Sync + 'static {
    fn fetch_states(&self) -> impl Future<Output = Result<LiveStates>> + Send;
}

/// Historical samples query over `[start, end]` (epoch seconds).
pub trait HistorySource: Send + Sync + 'static {
    fn fetch_history(
        &self,
        entity_ids: &BTreeSet<String>,
        start: f64,
        end: f64,
    ) -> impl Future<Output = Result<HistoryBatch>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str, value: &str, unit: Option<&str>) -> EntityState {
        EntityState {
            entity_id: id.to_string(),
            state: value.to_string(),
            attributes: StateAttributes {
                unit_of_measurement: unit.map(str::to_string),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("12.5"), Some(12.5));
        assert_eq!(parse_state(" -3 "), Some(-3.0));
        assert_eq!(parse_state("unavailable"), None);
        assert_eq!(parse_state("unknown"), None);
        assert_eq!(parse_state(""), None);
        assert_eq!(parse_state("NaN"), None);
    }

    #[test]
    fn test_missing_power_reads_as_zero() {
        let states: LiveStates = vec![
            state("sensor.a", "unavailable", Some("W")),
            state("sensor.b", "1.5", Some("kW")),
        ]
        .into_iter()
        .collect();

        assert_eq!(states.power("sensor.a"), 0.0);
        assert_eq!(states.power("sensor.b"), 1500.0);
        assert_eq!(states.power("sensor.missing"), 0.0);
    }

    #[test]
    fn test_declaration_deserialization() {
        let json = r#"{"stat_consumption": "sensor.washer_energy", "included_in_stat": "sensor.house_energy"}"#;
        let decl: ConsumptionDeclaration = serde_json::from_str(json).unwrap();
        assert_eq!(decl.stat_id, "sensor.washer_energy");
        assert_eq!(decl.included_in.as_deref(), Some("sensor.house_energy"));

        let json = r#"{"stat_consumption": "sensor.tv_energy"}"#;
        let decl: ConsumptionDeclaration = serde_json::from_str(json).unwrap();
        assert_eq!(decl.included_in, None);
    }
}
