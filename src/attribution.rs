//! Per-bucket attribution of consumed power to the sources that supplied it.
//!
//! Every non-source node gets, for each bucket, the share of its power that
//! each source delivered, proportional to that source's share of total source
//! power in the same bucket. Unmeasured children instead take, per source, the
//! clamped residual between their parent's share and their siblings' shares.
//!
//! Histories are aligned on the newest bucket. Source nodes are attribution
//! leaves: they never carry a breakdown and never get a residual.

use crate::tree::node::{Node, SourceBreakdown, SourceShare};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone)]
struct SourceSeries {
    id: String,
    color: String,
    history: Vec<f64>,
}

impl SourceSeries {
    fn at_age(&self, age: usize) -> f64 {
        at_age(&self.history, age).copied().unwrap_or(0.0)
    }
}

/// Element `age` buckets back from the newest one.
fn at_age<T>(items: &[T], age: usize) -> Option<&T> {
    items.len().checked_sub(age + 1).and_then(|i| items.get(i))
}

fn collect_sources(forest: &[Node]) -> Vec<SourceSeries> {
    let mut sources = Vec::new();
    for node in crate::tree::flatten(forest) {
        if let Some(color) = node.source_color() {
            sources.push(SourceSeries {
                id: node.id.clone(),
                color: color.to_string(),
                history: node.power_history.iter().copied().collect(),
            });
        }
    }
    sources
}

/// Recompute `source_power_history` for the whole forest.
pub fn attribute(forest: &mut [Node]) {
    let sources = collect_sources(forest);
    for node in forest.iter_mut() {
        attribute_node(node, &sources);
    }
    for node in forest.iter_mut() {
        fill_residuals(node);
    }
}

fn attribute_node(node: &mut Node, sources: &[SourceSeries]) {
    node.source_power_history = if node.is_source() {
        Vec::new()
    } else {
        proportional(&node.power_history, sources)
    };
    for child in node.children.iter_mut() {
        attribute_node(child, sources);
    }
}

fn proportional(history: &VecDeque<f64>, sources: &[SourceSeries]) -> Vec<SourceBreakdown> {
    let len = history.len();
    history
        .iter()
        .enumerate()
        .map(|(i, &power)| {
            let age = len - 1 - i;
            let total: f64 = sources.iter().map(|s| s.at_age(age)).sum();
            let mut breakdown = BTreeMap::new();
            if total > 0.0 && power > 0.0 {
                for source in sources {
                    let share = source.at_age(age);
                    if share > 0.0 {
                        breakdown.insert(
                            source.id.clone(),
                            SourceShare {
                                power: power * share / total,
                                color: source.color.clone(),
                            },
                        );
                    }
                }
            }
            breakdown
        })
        .collect()
}

fn fill_residuals(node: &mut Node) {
    if node.unmeasured_child().is_some() {
        let breakdown = residual_breakdown(node);
        if let Some(child) = node.unmeasured_child_mut() {
            child.source_power_history = breakdown;
        }
    }
    for child in node.children.iter_mut() {
        fill_residuals(child);
    }
}

fn residual_breakdown(parent: &Node) -> Vec<SourceBreakdown> {
    let len = parent.source_power_history.len();
    parent
        .source_power_history
        .iter()
        .enumerate()
        .map(|(i, bucket)| {
            let age = len - 1 - i;
            bucket
                .iter()
                .filter_map(|(source_id, share)| {
                    let siblings: f64 = parent
                        .measured_children()
                        .filter_map(|c| at_age(&c.source_power_history, age))
                        .filter_map(|b| b.get(source_id))
                        .map(|s| s.power)
                        .sum();
                    let power = share.power - siblings;
                    (power > 0.0).then(|| {
                        (
                            source_id.clone(),
                            SourceShare {
                                power,
                                color: share.color.clone(),
                            },
                        )
                    })
                })
                .collect()
        })
        .collect()
}
