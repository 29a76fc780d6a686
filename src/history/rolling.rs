//! Live path: a fixed-capacity sliding window of buckets per node. The newest
//! bucket is "open" and holds the running mean of every sample recorded since
//! the last rollover.

use crate::host::LiveStates;
use crate::tree::node::{Node, NodeKind};
use crate::tree::{aggregate, unmeasured};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Empty,
    Filling,
    Full,
}

pub fn window_state(node: &Node, capacity: usize) -> WindowState {
    match node.power_history.len() {
        0 => WindowState::Empty,
        n if n >= capacity => WindowState::Full,
        _ => WindowState::Filling,
    }
}

/// Close the open bucket on every node and open a new one carrying the last
/// value forward. Empty windows stay empty.
pub fn advance(forest: &mut [Node], capacity: usize) {
    for node in forest.iter_mut() {
        advance_node(node, capacity);
    }
}

fn advance_node(node: &mut Node, capacity: usize) {
    if let Some(&last) = node.power_history.back() {
        node.power_history.push_back(last);
    }
    while node.power_history.len() > capacity {
        node.power_history.pop_front();
    }
    node.live.reset();

    for child in node.children.iter_mut() {
        advance_node(child, capacity);
    }
}

/// Feed one live reading per node into the open buckets. Children are recorded
/// before their parent so virtual sums and residuals see fresh values.
pub fn record(forest: &mut [Node], states: &LiveStates, capacity: usize) {
    for node in forest.iter_mut() {
        record_node(node, states, capacity);
    }
}

fn record_node(node: &mut Node, states: &LiveStates, capacity: usize) {
    for child in node.children.iter_mut().filter(|c| !c.is_unmeasured()) {
        record_node(child, states, capacity);
    }

    let value = match &node.kind {
        NodeKind::Physical {
            power_sensor_id,
            value_type,
            ..
        }
        | NodeKind::Source {
            power_sensor_id,
            value_type,
            ..
        } => value_type.apply(states.power(power_sensor_id)),
        NodeKind::Virtual => aggregate::live_sum(node),
        // fed by the parent
        NodeKind::Unmeasured => return,
    };
    push_sample(node, value, capacity);

    // The residual of the bucket means, not the mean of per-sample residuals.
    if let Some(residual) = unmeasured::live_residual(node) {
        let bucket = unmeasured::open_bucket_residual(node);
        if let Some(child) = node.unmeasured_child_mut() {
            child.power_value = Some(residual);
            set_open_bucket(child, bucket, capacity);
        }
    }
}

fn push_sample(node: &mut Node, value: f64, capacity: usize) {
    node.power_value = Some(value);
    let mean = node.live.push(value);
    set_open_bucket(node, mean, capacity);
}

fn set_open_bucket(node: &mut Node, value: f64, capacity: usize) {
    if node.power_history.is_empty() {
        node.power_history.push_back(0.0);
    }
    if let Some(open) = node.power_history.back_mut() {
        *open = value;
    }
    while node.power_history.len() > capacity {
        node.power_history.pop_front();
    }
}

/// One timer period: roll every window, then record the current readings.
pub fn tick(forest: &mut [Node], states: &LiveStates, capacity: usize) {
    advance(forest, capacity);
    record(forest, states, capacity);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{EntityState, StateAttributes};
    use crate::tree::node::ValueType;
    use crate::tree::unmeasured::augment;
    use std::collections::VecDeque;

    fn states(readings: &[(&str, &str)]) -> LiveStates {
        readings
            .iter()
            .map(|(id, value)| EntityState {
                entity_id: id.to_string(),
                state: value.to_string(),
                attributes: StateAttributes::default(),
            })
            .collect()
    }

    fn leaf(id: &str) -> Node {
        Node::physical(id, id, format!("sensor.{}", id), None, ValueType::Default)
    }

    #[test]
    fn test_samples_within_bucket_are_averaged() {
        let mut forest = vec![leaf("a")];
        record(&mut forest, &states(&[("sensor.a", "10")]), 5);
        record(&mut forest, &states(&[("sensor.a", "20")]), 5);

        assert_eq!(forest[0].power_history, VecDeque::from(vec![15.0]));
        assert_eq!(forest[0].power_value, Some(20.0));
    }

    #[test]
    fn test_rollover_carries_forward_and_resets_mean() {
        let mut forest = vec![leaf("a")];
        record(&mut forest, &states(&[("sensor.a", "10")]), 5);
        record(&mut forest, &states(&[("sensor.a", "20")]), 5);
        advance(&mut forest, 5);
        assert_eq!(forest[0].power_history, VecDeque::from(vec![15.0, 15.0]));

        record(&mut forest, &states(&[("sensor.a", "40")]), 5);
        assert_eq!(forest[0].power_history, VecDeque::from(vec![15.0, 40.0]));
    }

    #[test]
    fn test_advance_on_empty_window_is_noop() {
        let mut forest = vec![leaf("a")];
        advance(&mut forest, 3);
        assert_eq!(window_state(&forest[0], 3), WindowState::Empty);
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut forest = vec![leaf("a")];
        let readings = states(&[("sensor.a", "1")]);
        for n in 1..=8 {
            tick(&mut forest, &readings, 5);
            assert_eq!(forest[0].power_history.len(), n.min(5));
        }
        assert_eq!(window_state(&forest[0], 5), WindowState::Full);
    }

    #[test]
    fn test_oldest_bucket_is_dropped_first() {
        let mut forest = vec![leaf("a")];
        for value in ["1", "2", "3", "4"] {
            tick(&mut forest, &states(&[("sensor.a", value)]), 3);
        }
        assert_eq!(forest[0].power_history, VecDeque::from(vec![2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_value_type_applied_before_insertion() {
        let mut forest = vec![
            Node::physical("export", "Export", "sensor.grid", None, ValueType::Negative),
            Node::physical("import", "Import", "sensor.grid", None, ValueType::Positive),
        ];
        record(&mut forest, &states(&[("sensor.grid", "-75")]), 5);

        assert_eq!(forest[0].power_value, Some(75.0));
        assert_eq!(forest[1].power_value, Some(0.0));
    }

    #[test]
    fn test_missing_reading_records_zero() {
        let mut forest = vec![leaf("a")];
        record(&mut forest, &states(&[("sensor.a", "unavailable")]), 5);
        assert_eq!(forest[0].power_value, Some(0.0));
        assert_eq!(forest[0].power_history, VecDeque::from(vec![0.0]));
    }

    #[test]
    fn test_unmeasured_bucket_is_residual_of_bucket_means() {
        let mut forest = vec![leaf("a").with_children(vec![leaf("b")])];
        augment(&mut forest, "Unmeasured");

        record(&mut forest, &states(&[("sensor.a", "100"), ("sensor.b", "150")]), 5);
        record(&mut forest, &states(&[("sensor.a", "100"), ("sensor.b", "50")]), 5);

        let a = &forest[0];
        assert_eq!(a.power_history, VecDeque::from(vec![100.0]));
        assert_eq!(a.children[0].power_history, VecDeque::from(vec![100.0]));
        let residual = a.unmeasured_child().unwrap();
        assert_eq!(residual.power_history, VecDeque::from(vec![0.0]));
        assert_eq!(residual.power_value, Some(50.0));
    }

    #[test]
    fn test_residual_and_virtual_follow_children() {
        let mut forest = vec![Node::virtual_node("v", "V").with_children(vec![
            leaf("a").with_children(vec![leaf("b"), leaf("c")]),
            leaf("d"),
        ])];
        augment(&mut forest, "Unmeasured");

        let readings = states(&[
            ("sensor.a", "300"),
            ("sensor.b", "100"),
            ("sensor.c", "50"),
            ("sensor.d", "25"),
        ]);
        tick(&mut forest, &readings, 10);

        let v = &forest[0];
        assert_eq!(v.power_value, Some(325.0));
        assert_eq!(v.unmeasured_child().unwrap().power_value, Some(0.0));
        let a = &v.children[0];
        assert_eq!(a.unmeasured_child().unwrap().power_value, Some(150.0));
        assert_eq!(
            a.unmeasured_child().unwrap().power_history,
            VecDeque::from(vec![150.0])
        );
    }
}
