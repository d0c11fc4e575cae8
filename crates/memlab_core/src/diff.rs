//! Comparison of two snapshots by buffer identity

use crate::{ReportSnapshot, StorageGroup};
use std::collections::HashSet;

/// Groups that appeared, disappeared or survived between two snapshots.
pub struct SnapshotDiff<'a> {
    pub before: &'a ReportSnapshot,
    pub after: &'a ReportSnapshot,
    /// Only in `after`.
    pub new: Vec<&'a StorageGroup>,
    /// Only in `before`.
    pub freed: Vec<&'a StorageGroup>,
    /// In both, as found in `after`.
    pub unchanged: Vec<&'a StorageGroup>,
}

impl SnapshotDiff<'_> {
    pub fn new_bytes(&self) -> u64 {
        self.new.iter().map(|g| g.bytes()).sum()
    }

    pub fn freed_bytes(&self) -> u64 {
        self.freed.iter().map(|g| g.bytes()).sum()
    }

    /// No group was allocated or freed.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.freed.is_empty()
    }
}

pub fn diff<'a>(before: &'a ReportSnapshot, after: &'a ReportSnapshot) -> SnapshotDiff<'a> {
    let before_ids: HashSet<_> = before.groups().iter().map(|g| g.buffer()).collect();
    let after_ids: HashSet<_> = after.groups().iter().map(|g| g.buffer()).collect();

    let (unchanged, new) = after
        .groups()
        .iter()
        .partition(|g| before_ids.contains(&g.buffer()));
    let freed = before
        .groups()
        .iter()
        .filter(|g| !after_ids.contains(&g.buffer()))
        .collect();

    SnapshotDiff {
        before,
        after,
        new,
        freed,
        unchanged,
    }
}
