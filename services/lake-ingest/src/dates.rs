//! Compact trade-date helpers.
//!
//! The vendor represents dates as `YYYYMMDD` strings and the lake keeps that
//! representation (fixed-width, so lexicographic max equals chronological
//! max). Everything crossing into planning logic converts to `NaiveDate`.

use chrono::{Datelike, NaiveDate};

/// Parse a compact `YYYYMMDD` date.
pub fn parse_compact(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y%m%d").ok()
}

/// Format a date back to compact `YYYYMMDD`.
pub fn format_compact(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Year of a compact date string, if it parses.
pub fn year_of_compact(s: &str) -> Option<i32> {
    parse_compact(s).map(|d| d.year())
}
