//! Builds the power forest from the host's consumption declarations and
//! registries.

use crate::config::{EngineConfig, HouseSpec, SourceSpec};
use crate::host::{
    ConsumptionDeclaration, DeviceRegistryEntry, EntityRegistryEntry, LiveStates, Registries,
};
use crate::tree::node::{Node, ValueType};
use crate::tree::unmeasured;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub const HOUSE_NODE_ID: &str = "house";

/// Entities of the declaration's device that can serve as bindings.
#[derive(Debug, Clone)]
pub struct Candidates<'a> {
    pub device: &'a DeviceRegistryEntry,
    pub power: Vec<&'a EntityRegistryEntry>,
    pub switches: Vec<&'a EntityRegistryEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub power_sensor_id: String,
    pub switch_entity_id: Option<String>,
}

/// Lookup tables over the registries, built once per tree build.
pub struct RegistryIndex<'a> {
    entities: HashMap<&'a str, &'a EntityRegistryEntry>,
    by_device: HashMap<&'a str, Vec<&'a EntityRegistryEntry>>,
    devices: HashMap<&'a str, &'a DeviceRegistryEntry>,
    labels: HashMap<&'a str, &'a str>,
    states: &'a LiveStates,
}

impl<'a> RegistryIndex<'a> {
    pub fn new(registries: &'a Registries, states: &'a LiveStates) -> Self {
        let mut by_device: HashMap<&str, Vec<&EntityRegistryEntry>> = HashMap::new();
        for entity in &registries.entities {
            if let Some(device_id) = entity.device_id.as_deref() {
                by_device.entry(device_id).or_default().push(entity);
            }
        }

        Self {
            entities: registries
                .entities
                .iter()
                .map(|e| (e.entity_id.as_str(), e))
                .collect(),
            by_device,
            devices: registries
                .devices
                .iter()
                .map(|d| (d.device_id.as_str(), d))
                .collect(),
            labels: registries
                .labels
                .iter()
                .map(|l| (l.name.as_str(), l.label_id.as_str()))
                .collect(),
            states,
        }
    }

    /// Label names are configured; entities carry label ids.
    pub fn label_id(&self, name: &str) -> Option<&'a str> {
        self.labels.get(name).copied()
    }

    pub fn candidates(&self, declaration: &ConsumptionDeclaration) -> Option<Candidates<'a>> {
        let entity = *self.entities.get(declaration.stat_id.as_str())?;
        let device_id = entity.device_id.as_deref()?;
        let device = *self.devices.get(device_id)?;
        let siblings = self.by_device.get(device_id).map(Vec::as_slice).unwrap_or(&[]);

        let power = siblings
            .iter()
            .copied()
            .filter(|e| {
                self.states
                    .get(&e.entity_id)
                    .map(|s| s.is_power())
                    .unwrap_or(false)
            })
            .collect();
        let switches = siblings
            .iter()
            .copied()
            .filter(|e| e.entity_id.starts_with("switch."))
            .collect();

        Some(Candidates {
            device,
            power,
            switches,
        })
    }

    pub fn resolve(
        &self,
        declaration: &ConsumptionDeclaration,
        power_label: Option<&str>,
        switch_label: Option<&str>,
    ) -> Option<Binding> {
        let candidates = self.candidates(declaration)?;

        let power_label_id = power_label.and_then(|l| self.label_id(l));
        let labelled = if candidates.power.len() > 1 {
            pick_labelled(&candidates.power, power_label_id)
        } else {
            None
        };
        let power = labelled.or_else(|| candidates.power.first().copied())?;

        let switch_label_id = switch_label.and_then(|l| self.label_id(l));
        let switch = pick_labelled(&candidates.switches, switch_label_id).or_else(|| {
            candidates.switches.iter().copied().find(|e| {
                self.states.friendly_name(&e.entity_id) == Some(candidates.device.name.as_str())
            })
        });

        Some(Binding {
            power_sensor_id: power.entity_id.clone(),
            switch_entity_id: switch.map(|s| s.entity_id.clone()),
        })
    }
}

/// First candidate carrying `label_id`, in input order.
pub fn pick_labelled<'e>(
    candidates: &[&'e EntityRegistryEntry],
    label_id: Option<&str>,
) -> Option<&'e EntityRegistryEntry> {
    let label_id = label_id?;
    candidates
        .iter()
        .copied()
        .find(|e| e.labels.iter().any(|l| l == label_id))
}

/// Build the forest: sources, then the house root (or the declaration roots),
/// then sinks, with unmeasured children injected last.
pub fn build_tree(registries: &Registries, states: &LiveStates, config: &EngineConfig) -> Vec<Node> {
    let index = RegistryIndex::new(registries, states);
    let roots = build_declaration_forest(&index, &registries.device_consumption, states, config);

    let mut forest: Vec<Node> = config.sources.iter().map(source_node).collect();

    match &config.house {
        Some(house) => forest.push(house_node(house, roots, states, config)),
        None => forest.extend(roots),
    }

    forest.extend(config.sources.iter().filter_map(sink_node));

    unmeasured::augment(&mut forest, &config.unmeasured_title);

    info!(
        roots = forest.len(),
        nodes = crate::tree::flatten(&forest).len(),
        "power tree built"
    );
    forest
}

fn display_name(sensor_id: &str, states: &LiveStates, config: &EngineConfig) -> String {
    let raw = states.friendly_name(sensor_id).unwrap_or(sensor_id);
    config.name_cleaner.clean(raw)
}

fn build_declaration_forest(
    index: &RegistryIndex<'_>,
    declarations: &[ConsumptionDeclaration],
    states: &LiveStates,
    config: &EngineConfig,
) -> Vec<Node> {
    let mut slots: Vec<Option<Node>> = Vec::new();
    let mut kept: Vec<&ConsumptionDeclaration> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for declaration in declarations {
        if !seen.insert(declaration.stat_id.as_str()) {
            warn!(stat = %declaration.stat_id, "duplicate consumption declaration skipped");
            continue;
        }

        let Some(binding) = index.resolve(
            declaration,
            config.power_sensor_label.as_deref(),
            config.power_switch_label.as_deref(),
        ) else {
            warn!(
                stat = %declaration.stat_id,
                "could not find a power sensor, device will be skipped"
            );
            continue;
        };

        debug!(
            stat = %declaration.stat_id,
            sensor = %binding.power_sensor_id,
            switch = ?binding.switch_entity_id,
            "declaration resolved"
        );

        let name = display_name(&binding.power_sensor_id, states, config);
        position.insert(declaration.stat_id.as_str(), slots.len());
        kept.push(declaration);
        slots.push(Some(Node::physical(
            declaration.stat_id.clone(),
            name,
            binding.power_sensor_id,
            binding.switch_entity_id,
            ValueType::Default,
        )));
    }

    let mut parent_of: Vec<Option<usize>> = kept
        .iter()
        .enumerate()
        .map(|(i, d)| {
            d.included_in
                .as_deref()
                .and_then(|p| position.get(p).copied())
                .filter(|&p| p != i)
        })
        .collect();
    break_cycles(&mut parent_of, &kept);

    let mut children_of: Vec<Vec<usize>> = vec![Vec::new(); kept.len()];
    let mut roots = Vec::new();
    for (i, parent) in parent_of.iter().enumerate() {
        match parent {
            Some(p) => children_of[*p].push(i),
            None => roots.push(i),
        }
    }

    roots
        .into_iter()
        .filter_map(|i| assemble(i, &mut slots, &children_of))
        .collect()
}

/// Detach the first declaration (input order) of every "included in" cycle.
fn break_cycles(parent_of: &mut [Option<usize>], kept: &[&ConsumptionDeclaration]) {
    for start in 0..parent_of.len() {
        let mut visited = HashSet::new();
        let mut current = parent_of[start];
        while let Some(node) = current {
            if node == start {
                warn!(
                    stat = %kept[start].stat_id,
                    "cyclic included_in chain, declaration promoted to root"
                );
                parent_of[start] = None;
                break;
            }
            if !visited.insert(node) {
                break;
            }
            current = parent_of[node];
        }
    }
}

fn assemble(index: usize, slots: &mut [Option<Node>], children_of: &[Vec<usize>]) -> Option<Node> {
    let mut node = slots[index].take()?;
    node.children = children_of[index]
        .iter()
        .filter_map(|&child| assemble(child, slots, children_of))
        .collect();
    Some(node)
}

fn house_node(
    house: &HouseSpec,
    children: Vec<Node>,
    states: &LiveStates,
    config: &EngineConfig,
) -> Node {
    let node = match &house.entity_id {
        Some(entity_id) => {
            let name = display_name(entity_id, states, config);
            Node::physical(HOUSE_NODE_ID, name, entity_id.clone(), None, ValueType::Default)
        }
        None => Node::virtual_node(HOUSE_NODE_ID, house.title.clone()),
    };
    node.with_children(children)
}

fn source_node(spec: &SourceSpec) -> Node {
    Node::source(
        spec.kind,
        spec.source_name.clone(),
        spec.entity_id.clone(),
        spec.color.clone(),
    )
}

/// Grid export and battery charging consume from the other sources.
fn sink_node(spec: &SourceSpec) -> Option<Node> {
    let name = spec.consumption_name.as_ref()?;
    Some(Node::physical(
        format!("sink:{}", spec.kind.as_str()),
        name.clone(),
        spec.entity_id.clone(),
        None,
        ValueType::Negative,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::host::{EntityState, LabelRegistryEntry, StateAttributes};

    fn entity(id: &str, device: &str, labels: &[&str]) -> EntityRegistryEntry {
        EntityRegistryEntry {
            entity_id: id.to_string(),
            device_id: Some(device.to_string()),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn power_state(id: &str, name: &str) -> EntityState {
        EntityState {
            entity_id: id.to_string(),
            state: "0".to_string(),
            attributes: StateAttributes {
                friendly_name: Some(name.to_string()),
                device_class: Some("power".to_string()),
                unit_of_measurement: Some("W".to_string()),
                icon: None,
            },
        }
    }

    fn named_state(id: &str, name: &str) -> EntityState {
        EntityState {
            entity_id: id.to_string(),
            state: "on".to_string(),
            attributes: StateAttributes {
                friendly_name: Some(name.to_string()),
                ..Default::default()
            },
        }
    }

    fn washer_registries() -> Registries {
        Registries {
            device_consumption: vec![ConsumptionDeclaration {
                stat_id: "sensor.washer_energy".into(),
                included_in: None,
            }],
            entities: vec![
                entity("sensor.washer_energy", "washer", &[]),
                entity("sensor.washer_power_total", "washer", &[]),
                entity("sensor.washer_power_motor", "washer", &["lbl_main"]),
                entity("switch.washer_child_lock", "washer", &[]),
                entity("switch.washer", "washer", &[]),
            ],
            devices: vec![DeviceRegistryEntry {
                device_id: "washer".into(),
                name: "Washer".into(),
            }],
            labels: vec![LabelRegistryEntry {
                label_id: "lbl_main".into(),
                name: "Main power".into(),
            }],
        }
    }

    fn washer_states() -> LiveStates {
        vec![
            power_state("sensor.washer_power_total", "Washer Total Power"),
            power_state("sensor.washer_power_motor", "Washer Motor Power"),
            named_state("switch.washer_child_lock", "Washer Child Lock"),
            named_state("switch.washer", "Washer"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_resolve_without_label_takes_first_candidate() {
        let registries = washer_registries();
        let states = washer_states();
        let index = RegistryIndex::new(&registries, &states);

        let binding = index
            .resolve(&registries.device_consumption[0], None, None)
            .unwrap();
        assert_eq!(binding.power_sensor_id, "sensor.washer_power_total");
        // falls back to the switch named like the device
        assert_eq!(binding.switch_entity_id.as_deref(), Some("switch.washer"));
    }

    #[test]
    fn test_resolve_prefers_labelled_sensor() {
        let registries = washer_registries();
        let states = washer_states();
        let index = RegistryIndex::new(&registries, &states);

        let binding = index
            .resolve(&registries.device_consumption[0], Some("Main power"), None)
            .unwrap();
        assert_eq!(binding.power_sensor_id, "sensor.washer_power_motor");
    }

    #[test]
    fn test_unknown_label_falls_back_to_first() {
        let registries = washer_registries();
        let states = washer_states();
        let index = RegistryIndex::new(&registries, &states);

        let binding = index
            .resolve(&registries.device_consumption[0], Some("Nope"), Some("Nope"))
            .unwrap();
        assert_eq!(binding.power_sensor_id, "sensor.washer_power_total");
        assert_eq!(binding.switch_entity_id.as_deref(), Some("switch.washer"));
    }

    #[test]
    fn test_labelled_switch_wins_over_name_match() {
        let mut registries = washer_registries();
        registries.entities[3].labels.push("lbl_switch".into());
        registries.labels.push(LabelRegistryEntry {
            label_id: "lbl_switch".into(),
            name: "Switch".into(),
        });
        let states = washer_states();
        let index = RegistryIndex::new(&registries, &states);

        let binding = index
            .resolve(&registries.device_consumption[0], None, Some("Switch"))
            .unwrap();
        assert_eq!(
            binding.switch_entity_id.as_deref(),
            Some("switch.washer_child_lock")
        );
    }

    #[test]
    fn test_declaration_without_device_is_unresolved() {
        let mut registries = washer_registries();
        registries.entities[0].device_id = None;
        let states = washer_states();
        let index = RegistryIndex::new(&registries, &states);

        assert!(index
            .resolve(&registries.device_consumption[0], None, None)
            .is_none());
    }

    #[test]
    fn test_break_cycles_promotes_first_in_order() {
        let a = ConsumptionDeclaration {
            stat_id: "a".into(),
            included_in: Some("b".into()),
        };
        let b = ConsumptionDeclaration {
            stat_id: "b".into(),
            included_in: Some("a".into()),
        };
        let kept = vec![&a, &b];
        let mut parent_of = vec![Some(1), Some(0)];

        break_cycles(&mut parent_of, &kept);

        assert_eq!(parent_of, vec![None, Some(0)]);
    }

    #[test]
    fn test_house_and_source_names() {
        let config = EngineConfig {
            house: Some(HouseSpec {
                entity_id: Some("sensor.house_power".into()),
                title: "House".into(),
            }),
            sources: vec![SourceSpec {
                kind: SourceKind::Solar,
                entity_id: "sensor.pv_power".into(),
                source_name: "Solar".into(),
                consumption_name: None,
                color: "#ffc107".into(),
            }],
            ..Default::default()
        };
        let states: LiveStates =
            std::iter::once(power_state("sensor.pv_power", "Roof PV")).collect();

        let forest = build_tree(&Registries::default(), &states, &config);

        assert_eq!(forest[0].name, "Solar");
        // no friendly name: the house is named by its sensor
        assert_eq!(forest[1].id, HOUSE_NODE_ID);
        assert_eq!(forest[1].name, "sensor.house_power");
    }
}
