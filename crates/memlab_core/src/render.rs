//! Text tables for snapshots and diffs

use crate::{ReportSnapshot, SnapshotDiff, StorageGroup};
use memlab_env::{readable_delta, readable_size, signed_delta, DeviceId, DeviceMemory};
use std::collections::BTreeSet;
use std::fmt::Write;

const NAME_WIDTH: usize = 44;
const SIZE_WIDTH: usize = 20;
const MEM_WIDTH: usize = 12;
const RULE_WIDTH: usize = NAME_WIDTH + SIZE_WIDTH + MEM_WIDTH;

const DIFFERS_NOTE: &str =
    "Memory differs due to the matrix alignment or invisible gradient buffer tensors";

fn rule(out: &mut String) {
    let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));
}

fn header(out: &mut String) {
    let _ = writeln!(
        out,
        "{:<NAME_WIDTH$}{:>SIZE_WIDTH$}{:>MEM_WIDTH$}",
        "Element type", "Size", "Used MEM"
    );
    rule(out);
}

fn shape(dims: &[usize]) -> String {
    let dims: Vec<String> = dims.iter().map(usize::to_string).collect();
    format!("({})", dims.join(", "))
}

fn row(out: &mut String, name: &str, dims: &[usize], mem: &str) {
    let _ = writeln!(
        out,
        "{:<NAME_WIDTH$}{:>SIZE_WIDTH$}{:>MEM_WIDTH$}",
        name,
        shape(dims),
        mem
    );
}

fn group_rows(out: &mut String, group: &StorageGroup, verbose: bool) {
    let primary = group.primary();
    row(out, &primary.name, &primary.shape, &readable_size(group.bytes()));
    if verbose {
        for alias in group.aliases() {
            let name = format!("{}(->{})", alias.name, primary.name);
            row(out, &name, &alias.shape, "");
        }
    }
}

fn device_rows<'a>(
    out: &mut String,
    device: DeviceId,
    groups: impl Iterator<Item = &'a StorageGroup>,
    verbose: bool,
) {
    let _ = writeln!(out, "Storage on {device}");
    for group in groups.filter(|g| g.device() == device) {
        group_rows(out, group, verbose);
    }
}

fn allocated(bytes: Option<u64>) -> String {
    bytes.map_or_else(|| "unavailable".to_string(), readable_size)
}

/// Render a snapshot, one block per device.
///
/// Non-verbose output shows one row per buffer under its primary name.
/// Verbose output adds a row for every alias, pointing at the primary.
pub fn render(snapshot: &ReportSnapshot, verbose: bool) -> String {
    let mut out = String::new();

    if snapshot.groups().is_empty() {
        header(&mut out);
        let _ = writeln!(out, "No tensors found");
        rule(&mut out);
    }

    for totals in snapshot.devices() {
        if totals.tensors > 0 {
            header(&mut out);
            device_rows(&mut out, totals.device, snapshot.groups().iter(), verbose);
            rule(&mut out);
        }
        let _ = writeln!(
            out,
            "Total Tensors: {} \tUsed Memory: {}",
            totals.tensors,
            readable_size(totals.bytes)
        );
        let _ = writeln!(
            out,
            "The allocated memory on {}: {}",
            totals.device,
            allocated(totals.allocated)
        );
        if totals.allocated.is_some_and(|a| a != totals.bytes) {
            let _ = writeln!(out, "{DIFFERS_NOTE}");
        }
        rule(&mut out);
    }

    if snapshot.unresolved() > 0 {
        let _ = writeln!(
            out,
            "Unresolvable tensors skipped: {}",
            snapshot.unresolved()
        );
    }
    out
}

fn diff_section(out: &mut String, title: &str, groups: &[&StorageGroup]) {
    let _ = writeln!(out, "{title}");
    header(out);
    if groups.is_empty() {
        let _ = writeln!(out, "(none)");
    }
    let devices: BTreeSet<DeviceId> = groups.iter().map(|g| g.device()).collect();
    for device in devices {
        device_rows(out, device, groups.iter().copied(), false);
    }
    rule(out);
}

/// Render what changed between two snapshots.
///
/// A device missing from one side is queried from `memory` now, so the
/// allocator line is only `unavailable` when a query actually failed.
pub fn render_diff(
    diff: &SnapshotDiff<'_>,
    show_unchanged: bool,
    memory: &dyn DeviceMemory,
) -> String {
    let mut out = String::new();
    diff_section(&mut out, "Newly allocated storage", &diff.new);
    diff_section(&mut out, "Freed storage", &diff.freed);
    if show_unchanged {
        diff_section(&mut out, "Unchanged storage", &diff.unchanged);
    }

    let _ = writeln!(
        out,
        "New storage: {} ({})\tFreed storage: {} ({})",
        diff.new.len(),
        readable_size(diff.new_bytes()),
        diff.freed.len(),
        readable_size(diff.freed_bytes())
    );

    let devices: BTreeSet<DeviceId> = diff
        .before
        .devices()
        .iter()
        .chain(diff.after.devices())
        .map(|d| d.device)
        .collect();
    for device in devices {
        let before = diff.before.device(device);
        let after = diff.after.device(device);
        let grouped = signed_delta(
            before.map_or(0, |d| d.bytes),
            after.map_or(0, |d| d.bytes),
        );
        let requery = || memory.allocated_bytes(device).ok();
        let before_alloc = before.map_or_else(requery, |d| d.allocated);
        let after_alloc = after.map_or_else(requery, |d| d.allocated);

        match (before_alloc, after_alloc) {
            (Some(b), Some(a)) => {
                let _ = writeln!(
                    out,
                    "The allocated memory on {device}: {} -> {} ({})",
                    readable_size(b),
                    readable_size(a),
                    readable_delta(signed_delta(b, a))
                );
                if signed_delta(b, a) != grouped {
                    let _ = writeln!(out, "{DIFFERS_NOTE}");
                }
            }
            _ => {
                let _ = writeln!(
                    out,
                    "The allocated memory on {device}: {} -> {}",
                    allocated(before_alloc),
                    allocated(after_alloc)
                );
            }
        }
    }
    rule(&mut out);
    out
}
