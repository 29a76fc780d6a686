//! Synthetic "unmeasured" children carrying the gap between a parent and the
//! sum of its measured children.

use crate::tree::node::Node;
use std::collections::VecDeque;

/// `max(0, parent - sum(children))`; noise can make the raw gap negative.
pub fn residual(parent: f64, children: impl IntoIterator<Item = f64>) -> f64 {
    (parent - children.into_iter().sum::<f64>()).max(0.0)
}

/// Give every non-leaf node exactly one unmeasured child. Running it again on
/// an augmented forest changes nothing. Sources are attribution leaves and are
/// left alone.
pub fn augment(forest: &mut [Node], title: &str) {
    for node in forest.iter_mut() {
        augment_node(node, title);
    }
}

fn augment_node(node: &mut Node, title: &str) {
    if node.is_unmeasured() || node.is_source() {
        return;
    }
    if node.measured_children().next().is_some() && node.unmeasured_child().is_none() {
        let residual_node = Node::unmeasured(&node.id, title);
        node.children.push(residual_node);
    }
    for child in node.children.iter_mut() {
        augment_node(child, title);
    }
}

/// Residual for the current live value; `None` when the node has no children.
pub fn live_residual(node: &Node) -> Option<f64> {
    node.unmeasured_child()?;
    Some(residual(
        node.power(),
        node.measured_children().map(Node::power),
    ))
}

/// Residual of the newest (open) bucket.
pub fn open_bucket_residual(node: &Node) -> f64 {
    let newest = |n: &Node| n.power_history.back().copied().unwrap_or(0.0);
    residual(newest(node), node.measured_children().map(newest))
}

/// Bucket-wise residual over the measured children's histories. Children
/// shorter than the parent count as 0 in the buckets they lack.
pub fn history_residual(node: &Node) -> VecDeque<f64> {
    let len = node.power_history.len();
    let mut out: VecDeque<f64> = node.power_history.iter().copied().collect();
    for child in node.measured_children() {
        for (idx, value) in (0..len).rev().zip(child.power_history.iter().rev()) {
            out[idx] -= value;
        }
    }
    for value in out.iter_mut() {
        *value = value.max(0.0);
    }
    out
}

/// Recompute every unmeasured child's history from its parent, top-down so a
/// residual never feeds into a stale sibling sum.
pub fn fill_history(forest: &mut [Node]) {
    for node in forest.iter_mut() {
        fill_node_history(node);
    }
}

fn fill_node_history(node: &mut Node) {
    if node.unmeasured_child().is_some() {
        let history = history_residual(node);
        if let Some(child) = node.unmeasured_child_mut() {
            child.power_history = history;
        }
    }
    for child in node.children.iter_mut() {
        fill_node_history(child);
    }
}
