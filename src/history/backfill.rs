//! One-shot historical backfill: fetch the recent history of every bound
//! sensor, resample it into the node windows and redo the derived series.

use crate::attribution;
use crate::error::Result;
use crate::history::resample::{resample_as, BucketWindow};
use crate::host::{HistoryBatch, HistorySample, HistorySource, SensorUnits};
use crate::tree::node::{Node, NodeKind};
use crate::tree::{aggregate, unmeasured};
use std::borrow::Cow;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Every sensor bound to a physical or source node, deduplicated.
pub fn sensor_ids(forest: &[Node]) -> BTreeSet<String> {
    crate::tree::flatten(forest)
        .into_iter()
        .filter_map(|n| n.power_sensor_id().map(str::to_string))
        .collect()
}

pub async fn fetch<H: HistorySource>(
    source: &H,
    sensors: &BTreeSet<String>,
    window: &BucketWindow,
) -> Result<HistoryBatch> {
    debug!(
        sensors = sensors.len(),
        start = window.start(),
        end = window.end,
        "requesting history"
    );
    source.fetch_history(sensors, window.start(), window.end).await
}

/// Overwrite every node's history from `batch`. Sensors missing from the
/// batch resample to all zeros; sensors without a known unit count as watts.
pub fn apply(forest: &mut [Node], batch: &HistoryBatch, window: &BucketWindow, units: &SensorUnits) {
    for node in forest.iter_mut() {
        apply_measured(node, batch, window, units);
    }
    aggregate::fill_history(forest);
    unmeasured::fill_history(forest);
    attribution::attribute(forest);

    info!(
        buckets = window.buckets,
        sensors = batch.len(),
        "history backfilled"
    );
}

fn apply_measured(node: &mut Node, batch: &HistoryBatch, window: &BucketWindow, units: &SensorUnits) {
    for child in node.children.iter_mut() {
        apply_measured(child, batch, window, units);
    }

    let (sensor, value_type) = match &node.kind {
        NodeKind::Physical {
            power_sensor_id,
            value_type,
            ..
        }
        | NodeKind::Source {
            power_sensor_id,
            value_type,
            ..
        } => (power_sensor_id.as_str(), *value_type),
        NodeKind::Virtual | NodeKind::Unmeasured => return,
    };

    let samples = batch.get(sensor).map(|s| ordered(s)).unwrap_or_default();
    let unit = units.get(sensor).map(String::as_str);
    let values = resample_as(&samples, window, value_type, unit);
    node.power_history = values.into();
}

/// History normally arrives oldest-first; sort only when it does not.
fn ordered(samples: &[HistorySample]) -> Cow<'_, [HistorySample]> {
    if samples
        .windows(2)
        .all(|w| w[0].last_updated <= w[1].last_updated)
    {
        Cow::Borrowed(samples)
    } else {
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.last_updated.total_cmp(&b.last_updated));
        Cow::Owned(sorted)
    }
}

/// Fetch and apply in one go. A failed fetch is logged and leaves the forest
/// exactly as the live path left it.
pub async fn backfill<H: HistorySource>(
    forest: &mut [Node],
    source: &H,
    units: &SensorUnits,
    buckets: usize,
    bucket_duration_secs: f64,
    now: f64,
) {
    let window = BucketWindow::new(buckets, bucket_duration_secs, now);
    let sensors = sensor_ids(forest);
    match fetch(source, &sensors, &window).await {
        Ok(batch) => apply(forest, &batch, &window, units),
        Err(e) => warn!(error = %e, "history fetch failed, keeping live history"),
    }
}
