//! Virtual nodes: value and history are always the sum of their measured children.

use crate::tree::node::Node;
use std::collections::VecDeque;

/// Current value of a virtual node from its children's current values.
pub fn live_sum(node: &Node) -> f64 {
    node.measured_children().map(Node::power).sum()
}

/// Bucket-wise sum of the measured children's histories, aligned on the newest
/// bucket. The result is as long as the longest child history.
pub fn history_sum(node: &Node) -> VecDeque<f64> {
    let len = node
        .measured_children()
        .map(|c| c.power_history.len())
        .max()
        .unwrap_or(0);
    let mut out = VecDeque::from(vec![0.0; len]);
    for child in node.measured_children() {
        for (idx, value) in (0..len).rev().zip(child.power_history.iter().rev()) {
            out[idx] += value;
        }
    }
    out
}

/// Rebuild every virtual node's history, children first.
pub fn fill_history(forest: &mut [Node]) {
    for node in forest.iter_mut() {
        fill_node_history(node);
    }
}

fn fill_node_history(node: &mut Node) {
    for child in node.children.iter_mut() {
        fill_node_history(child);
    }
    if node.is_virtual() {
        node.power_history = history_sum(node);
    }
}
