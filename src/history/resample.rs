//! Step resampling of irregular state changes into uniform buckets.

use crate::host::HistorySample;
use crate::tree::node::ValueType;
use crate::units;

/// `buckets` slots of `duration` seconds, the newest ending at `end`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketWindow {
    pub buckets: usize,
    pub duration: f64,
    pub end: f64,
}

impl BucketWindow {
    pub fn new(buckets: usize, duration: f64, end: f64) -> Self {
        Self {
            buckets,
            duration,
            end,
        }
    }

    /// Exclusive end of bucket `i`, 0 being the oldest.
    pub fn bucket_end(&self, i: usize) -> f64 {
        self.end - (self.buckets - 1 - i) as f64 * self.duration
    }

    pub fn start(&self) -> f64 {
        self.end - self.buckets as f64 * self.duration
    }
}

/// Bucket `i` holds the last parseable sample strictly before its end; buckets
/// before the first sample hold 0. `samples` must be sorted oldest-first.
pub fn resample(samples: &[HistorySample], window: &BucketWindow) -> Vec<f64> {
    let mut out = Vec::with_capacity(window.buckets);
    let mut cursor = 0;
    let mut carried = 0.0;

    for i in 0..window.buckets {
        let end = window.bucket_end(i);
        while let Some(sample) = samples.get(cursor) {
            if sample.last_updated >= end {
                break;
            }
            if let Some(value) = sample.value() {
                carried = value;
            }
            cursor += 1;
        }
        out.push(carried);
    }

    out
}

/// Resample, scale to watts and apply the node's sign convention.
pub fn resample_as(
    samples: &[HistorySample],
    window: &BucketWindow,
    value_type: ValueType,
    unit: Option<&str>,
) -> Vec<f64> {
    let scale = units::to_watts(1.0, unit);
    let mut values = resample(samples, window);
    for value in values.iter_mut() {
        *value = value_type.apply(*value * scale);
    }
    values
}
