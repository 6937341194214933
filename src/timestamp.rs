//! Timestamp forms used in Entries lines and `Mod-time` responses.
//!
//! Entries carry `asctime(3)` style UTC stamps (`Sun Oct 18 12:00:00 2026`).
//! `Mod-time` carries an RFC 822 style stamp (`18 Oct 2026 12:00:00 -0000`).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fs::Metadata;

const ASCTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";
const MODTIME_FORMAT: &str = "%-d %b %Y %H:%M:%S -0000";

/// Format unix seconds as an Entries timestamp.
pub fn format_entry_time(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format(ASCTIME_FORMAT).to_string(),
        None => "Thu Jan  1 00:00:00 1970".to_string(),
    }
}

/// Parse an Entries timestamp back to unix seconds.
pub fn parse_entry_time(s: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(s.trim(), ASCTIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

pub fn format_mod_time(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format(MODTIME_FORMAT).to_string(),
        None => "1 Jan 1970 00:00:00 -0000".to_string(),
    }
}

/// Parse a `Mod-time` argument. Accepts the RFC 822 form with or without a
/// leading weekday.
pub fn parse_mod_time(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    DateTime::parse_from_str(s, "%d %b %Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.timestamp())
}

/// Modification time of a file in whole seconds, the resolution Entries keeps.
pub fn mtime_secs(meta: &Metadata) -> i64 {
    filetime::FileTime::from_last_modification_time(meta).unix_seconds()
}

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_time_roundtrip() {
        let secs = 1_792_324_800; // 2026-10-18 12:00:00 UTC
        let s = format_entry_time(secs);
        assert_eq!(s, "Sun Oct 18 12:00:00 2026");
        assert_eq!(parse_entry_time(&s), Some(secs));
    }

    #[test]
    fn test_entry_time_single_digit_day() {
        let s = format_entry_time(1_791_460_800); // 2026-10-08 12:00:00 UTC
        assert_eq!(s, "Thu Oct  8 12:00:00 2026");
        assert_eq!(parse_entry_time(&s), Some(1_791_460_800));
    }

    #[test]
    fn test_mod_time() {
        let secs = 1_792_324_800;
        let s = format_mod_time(secs);
        assert_eq!(s, "18 Oct 2026 12:00:00 -0000");
        assert_eq!(parse_mod_time(&s), Some(secs));
        assert_eq!(parse_mod_time("Sun, 18 Oct 2026 12:00:00 +0000"), Some(secs));
        assert_eq!(parse_mod_time("garbage"), None);
    }
}
