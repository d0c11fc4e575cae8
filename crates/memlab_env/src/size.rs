//! Binary-prefix byte formatting, e.g. `512.00B`, `1.00M`, `2.50G`.

const UNITS: [&str; 4] = ["B", "K", "M", "G"];

/// Render a byte count with 1024-based units and two decimals.
pub fn readable_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

/// Like `readable_size`, but keeps the sign of a delta.
pub fn readable_delta(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", readable_size(bytes.unsigned_abs()))
    } else {
        readable_size(bytes as u64)
    }
}

/// Signed change from `before` to `after`, saturating at the `i64` bounds.
pub fn signed_delta(before: u64, after: u64) -> i64 {
    if after >= before {
        i64::try_from(after - before).unwrap_or(i64::MAX)
    } else {
        i64::try_from(before - after).map_or(i64::MIN, |d| -d)
    }
}
