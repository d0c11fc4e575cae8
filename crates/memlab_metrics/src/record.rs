//! Per-line memory samples and their reduction

use memlab_env::{signed_delta, DeviceId, MemoryStat};
use std::collections::BTreeMap;

/// Allocator readings taken around one execution of a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LineSample {
    pub before: MemoryStat,
    pub after: MemoryStat,
    pub device: DeviceId,
}

impl LineSample {
    pub fn allocated_delta(&self) -> i64 {
        signed_delta(self.before.allocated, self.after.allocated)
    }

    pub fn reserved_delta(&self) -> i64 {
        signed_delta(self.before.reserved, self.after.reserved)
    }
}

/// Maxima over any number of samples on one device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LineStats {
    /// "Max usage": largest allocated reading after the line.
    pub max_allocated: u64,
    /// "Peak usage": largest reserved reading after the line.
    pub max_reserved: u64,
    /// "diff max"
    pub max_allocated_delta: i64,
    /// "diff peak"
    pub max_reserved_delta: i64,
    pub visits: u64,
}

impl LineStats {
    fn from_sample(sample: &LineSample) -> Self {
        Self {
            max_allocated: sample.after.allocated,
            max_reserved: sample.after.reserved,
            max_allocated_delta: sample.allocated_delta(),
            max_reserved_delta: sample.reserved_delta(),
            visits: 1,
        }
    }

    /// Elementwise maximum; visits add up.
    pub fn merge(&mut self, other: &LineStats) {
        self.max_allocated = self.max_allocated.max(other.max_allocated);
        self.max_reserved = self.max_reserved.max(other.max_reserved);
        self.max_allocated_delta = self.max_allocated_delta.max(other.max_allocated_delta);
        self.max_reserved_delta = self.max_reserved_delta.max(other.max_reserved_delta);
        self.visits += other.visits;
    }
}

fn merge_into(map: &mut BTreeMap<DeviceId, LineStats>, device: DeviceId, stats: &LineStats) {
    map.entry(device)
        .and_modify(|existing| existing.merge(stats))
        .or_insert(*stats);
}

/// Everything recorded for one source line of a profiled routine.
///
/// Samples of the call in flight are kept in order; completed calls are
/// folded into per-device maxima.
#[derive(Clone, Debug)]
pub struct LineRecord {
    line: u32,
    samples: Vec<LineSample>,
    maxima: BTreeMap<DeviceId, LineStats>,
}

impl LineRecord {
    pub(crate) fn new(line: u32) -> Self {
        Self {
            line,
            samples: Vec::new(),
            maxima: BTreeMap::new(),
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Samples recorded since the last completed call.
    pub fn samples(&self) -> &[LineSample] {
        &self.samples
    }

    pub(crate) fn push(&mut self, sample: LineSample) {
        self.samples.push(sample);
    }

    /// Fold pending samples into the lifetime maxima and discard them.
    pub(crate) fn fold(&mut self) {
        for sample in self.samples.drain(..) {
            merge_into(&mut self.maxima, sample.device, &LineStats::from_sample(&sample));
        }
    }

    /// Per-device maxima over every sample seen so far, folded or not.
    pub fn stats(&self) -> BTreeMap<DeviceId, LineStats> {
        let mut stats = self.maxima.clone();
        for sample in &self.samples {
            merge_into(&mut stats, sample.device, &LineStats::from_sample(sample));
        }
        stats
    }

    pub fn is_visited(&self) -> bool {
        !self.samples.is_empty() || !self.maxima.is_empty()
    }
}
