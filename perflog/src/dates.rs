use chrono::{Local, NaiveDateTime, Timelike};

/// Metric timestamps are local wall-clock times without a zone, as written by the agents.

pub type Timestamp = NaiveDateTime;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// `%.f` prints nothing when the fraction is zero and accepts a missing fraction when parsing, so
// this one format reads both the agents' second-resolution stamps and the aggregator's output.
const PRECISE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// The current local time.

pub fn now() -> Timestamp {
    Local::now().naive_local()
}

/// Format a timestamp the way the agents write it, at second resolution.

pub fn format_timestamp(t: &Timestamp) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Format a timestamp with its sub-second part, if it has one.

pub fn format_precise(t: &Timestamp) -> String {
    t.format(PRECISE_TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp written by `format_timestamp` or `format_precise`.  Returns None for anything
/// else.

pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    NaiveDateTime::parse_from_str(s.trim(), PRECISE_TIMESTAMP_FORMAT).ok()
}

/// The name of a run directory created at time `t`: run_YYYY_MM_DD_HHMMSS.

pub fn run_dir_name(t: &Timestamp) -> String {
    format!(
        "run_{}",
        t.with_nanosecond(0).unwrap_or(*t).format("%Y_%m_%d_%H%M%S")
    )
}

#[cfg(test)]
use chrono::NaiveDate;

#[cfg(test)]
fn ymdhms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Timestamp {
    NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, mi, s)
        .unwrap()
}

#[test]
fn test_parse_timestamp() {
    assert!(parse_timestamp("2024-03-01 10:00:05") == Some(ymdhms(2024, 3, 1, 10, 0, 5)));
    assert!(parse_timestamp(" 2024-03-01 10:00:05 ") == Some(ymdhms(2024, 3, 1, 10, 0, 5)));

    let t = parse_timestamp("2024-03-01 10:00:05.900").unwrap();
    assert!(t.nanosecond() == 900_000_000);

    assert!(parse_timestamp("2024-03-01T10:00:05").is_none());
    assert!(parse_timestamp("yesterday").is_none());
    assert!(parse_timestamp("").is_none());
}

#[test]
fn test_format_timestamp() {
    let t = ymdhms(2024, 3, 1, 9, 8, 7);
    assert!(format_timestamp(&t) == "2024-03-01 09:08:07");
    assert!(format_precise(&t) == "2024-03-01 09:08:07");

    let t = t.with_nanosecond(250_000_000).unwrap();
    assert!(format_timestamp(&t) == "2024-03-01 09:08:07");
    assert!(format_precise(&t) == "2024-03-01 09:08:07.250");
    assert!(parse_timestamp(&format_precise(&t)) == Some(t));

    assert!(run_dir_name(&t) == "run_2024_03_01_090807");
}
