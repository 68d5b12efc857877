//! CSV export of attendance records.
//!
//! The header string and column order are a compatibility surface:
//! downstream spreadsheets key on `Date,Time,Student,Status` exactly.

use crate::types::AttendanceEntry;

pub const CSV_HEADER: &str = "Date,Time,Student,Status";

/// Render attendance entries as CSV, header row first, one row per
/// record. Times are rendered to minute precision.
pub fn to_csv(entries: &[AttendanceEntry]) -> String {
    let mut lines = Vec::with_capacity(entries.len() + 1);
    lines.push(CSV_HEADER.to_string());
    for entry in entries {
        lines.push(format!(
            "{},{},{},{}",
            entry.record.date.format("%Y-%m-%d"),
            entry.record.time.format("%H:%M"),
            entry.student_name,
            entry.record.status,
        ));
    }
    lines.join("\n")
}
