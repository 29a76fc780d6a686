pub mod aggregate;
pub mod builder;
pub mod node;
pub mod unmeasured;

pub use builder::{build_tree, RegistryIndex, HOUSE_NODE_ID};
pub use node::{
    find_node, flatten, sort_by_power_and_name, Node, NodeKind, SourceBreakdown, SourceShare,
    ValueType,
};
