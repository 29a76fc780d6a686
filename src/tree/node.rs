use crate::config::SourceKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Sign convention applied to raw sensor readings before they are stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Default,
    /// Negative readings clamp to 0
    Positive,
    /// Only the negative part counts, reported as a magnitude
    Negative,
}

impl ValueType {
    pub fn apply(&self, raw: f64) -> f64 {
        match self {
            ValueType::Default => raw,
            ValueType::Positive => raw.max(0.0),
            ValueType::Negative => {
                if raw < 0.0 {
                    -raw
                } else {
                    0.0
                }
            }
        }
    }
}

/// What a node is, with only the bindings that kind of node can have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeKind {
    /// A device read from a power sensor
    Physical {
        power_sensor_id: String,
        switch_entity_id: Option<String>,
        value_type: ValueType,
    },
    /// Value and history are the sum of the children
    Virtual,
    /// Residual between the parent and its measured children
    Unmeasured,
    /// Energy source taking part in attribution
    Source {
        source: SourceKind,
        power_sensor_id: String,
        value_type: ValueType,
        color: String,
    },
}

/// Power delivered by one source within one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceShare {
    pub power: f64,
    pub color: String,
}

/// Per-bucket breakdown keyed by source node id. Empty when nothing was attributed.
pub type SourceBreakdown = BTreeMap<String, SourceShare>;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct LiveAccumulator {
    pub(crate) sum: f64,
    pub(crate) count: u32,
}

impl LiveAccumulator {
    pub(crate) fn push(&mut self, value: f64) -> f64 {
        self.sum += value;
        self.count += 1;
        self.mean()
    }

    pub(crate) fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// One element of the power hierarchy. A parent owns its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub children: Vec<Node>,
    pub power_value: Option<f64>,
    pub power_history: VecDeque<f64>,
    pub source_power_history: Vec<SourceBreakdown>,
    #[serde(skip)]
    pub(crate) live: LiveAccumulator,
}

impl Node {
    fn with_kind(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            children: Vec::new(),
            power_value: None,
            power_history: VecDeque::new(),
            source_power_history: Vec::new(),
            live: LiveAccumulator::default(),
        }
    }

    pub fn physical(
        id: impl Into<String>,
        name: impl Into<String>,
        power_sensor_id: impl Into<String>,
        switch_entity_id: Option<String>,
        value_type: ValueType,
    ) -> Self {
        Self::with_kind(
            id,
            name,
            NodeKind::Physical {
                power_sensor_id: power_sensor_id.into(),
                switch_entity_id,
                value_type,
            },
        )
    }

    pub fn virtual_node(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(id, name, NodeKind::Virtual)
    }

    pub fn unmeasured(parent_id: &str, name: impl Into<String>) -> Self {
        Self::with_kind(format!("{}/unmeasured", parent_id), name, NodeKind::Unmeasured)
    }

    pub fn source(
        kind: SourceKind,
        name: impl Into<String>,
        power_sensor_id: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            format!("source:{}", kind.as_str()),
            name,
            NodeKind::Source {
                source: kind,
                power_sensor_id: power_sensor_id.into(),
                value_type: ValueType::Positive,
                color: color.into(),
            },
        )
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.children = children;
        self
    }

    pub fn power_sensor_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Physical {
                power_sensor_id, ..
            }
            | NodeKind::Source {
                power_sensor_id, ..
            } => Some(power_sensor_id),
            NodeKind::Virtual | NodeKind::Unmeasured => None,
        }
    }

    pub fn switch_entity_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Physical {
                switch_entity_id, ..
            } => switch_entity_id.as_deref(),
            _ => None,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match &self.kind {
            NodeKind::Physical { value_type, .. } | NodeKind::Source { value_type, .. } => {
                *value_type
            }
            NodeKind::Virtual | NodeKind::Unmeasured => ValueType::Default,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, NodeKind::Virtual)
    }

    pub fn is_unmeasured(&self) -> bool {
        matches!(self.kind, NodeKind::Unmeasured)
    }

    pub fn is_source(&self) -> bool {
        matches!(self.kind, NodeKind::Source { .. })
    }

    pub fn source_color(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Source { color, .. } => Some(color),
            _ => None,
        }
    }

    pub fn power(&self) -> f64 {
        self.power_value.unwrap_or(0.0)
    }

    pub fn unmeasured_child(&self) -> Option<&Node> {
        self.children.iter().find(|c| c.is_unmeasured())
    }

    pub fn unmeasured_child_mut(&mut self) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.is_unmeasured())
    }

    /// Children excluding the synthetic residual.
    pub fn measured_children(&self) -> impl Iterator<Item = &Node> {
        self.children.iter().filter(|c| !c.is_unmeasured())
    }

    pub fn find(&self, id: &str) -> Option<&Node> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    /// Depth-first, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Node)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// Find a node anywhere in a forest.
pub fn find_node<'a>(forest: &'a [Node], id: &str) -> Option<&'a Node> {
    forest.iter().find_map(|n| n.find(id))
}

/// All nodes of a forest, parents before children.
pub fn flatten(forest: &[Node]) -> Vec<&Node> {
    let mut out = Vec::new();
    for root in forest {
        root.walk(&mut |n| out.push(n));
    }
    out
}

/// Descending by current power, ties broken by name.
pub fn sort_by_power_and_name(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| {
        b.power()
            .total_cmp(&a.power())
            .then_with(|| a.name.cmp(&b.name))
    });
}
