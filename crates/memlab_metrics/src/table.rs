//! Text rendering of a profiling session

use crate::{LineStats, ProfileSession};
use memlab_env::{readable_delta, readable_size, DeviceId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

const RULE_WIDTH: usize = 80;

fn row(
    out: &mut String,
    line: u32,
    device: Option<String>,
    stats: Option<&LineStats>,
    text: &str,
) {
    let _ = write!(out, "{:>6}", line);
    if let Some(device) = device {
        let _ = write!(out, "{:>8}", device);
    }
    match stats {
        Some(s) => {
            let _ = write!(
                out,
                "{:>12}{:>12}{:>12}{:>12}",
                readable_size(s.max_allocated),
                readable_size(s.max_reserved),
                readable_delta(s.max_allocated_delta),
                readable_delta(s.max_reserved_delta),
            );
        }
        None => {
            let _ = write!(out, "{:>12}{:>12}{:>12}{:>12}", "", "", "", "");
        }
    }
    let _ = writeln!(out, "  {}", text);
}

/// Render one row per source line. Lines visited on several devices get
/// one row per device and a `Device` column.
pub(crate) fn render(session: &ProfileSession) -> String {
    let routine = session.routine();
    let stats: BTreeMap<u32, BTreeMap<DeviceId, LineStats>> = session
        .records()
        .map(|record| (record.line(), record.stats()))
        .collect();

    let lines: BTreeSet<u32> = routine.lines().chain(stats.keys().copied()).collect();
    let devices: BTreeSet<DeviceId> = stats.values().flat_map(|s| s.keys().copied()).collect();
    let show_device = devices.len() > 1;

    let mut out = String::new();
    let _ = write!(out, "## {}, calls: {}", routine.id(), session.calls());
    if session.was_interrupted() {
        out.push_str(" [interrupted, partial]");
    }
    out.push('\n');

    let _ = write!(out, "{:>6}", "Line #");
    if show_device {
        let _ = write!(out, "{:>8}", "Device");
    }
    let _ = writeln!(
        out,
        "{:>12}{:>12}{:>12}{:>12}  {}",
        "Max usage", "Peak usage", "diff max", "diff peak", "Line Contents"
    );
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));

    let mut peak_allocated = 0;
    let mut peak_reserved = 0;
    for line in lines {
        let text = routine.line_text(line).unwrap_or("");
        let per_device = stats.get(&line).filter(|s| !s.is_empty());
        match per_device {
            None => row(&mut out, line, show_device.then(String::new), None, text),
            Some(per_device) => {
                for (device, s) in per_device {
                    peak_allocated = peak_allocated.max(s.max_allocated);
                    peak_reserved = peak_reserved.max(s.max_reserved);
                    row(&mut out, line, show_device.then(|| device.to_string()), Some(s), text);
                }
            }
        }
    }

    let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));
    let _ = writeln!(
        out,
        "Max usage: {}\tPeak usage: {}\tCalls: {}",
        readable_size(peak_allocated),
        readable_size(peak_reserved),
        session.calls()
    );
    out
}
